use crate::error::{LoadfleetError, LoadfleetResult};

/// Return slice `current_split` of `total_splits` of a line-oriented data file.
///
/// Lines are dealt round-robin: line `n` belongs to slice `n % total_splits`.
/// Line endings are preserved. With `total_splits <= 1` the input is returned unchanged.
pub fn split_csv(content: &[u8], total_splits: u32, current_split: u32) -> LoadfleetResult<Vec<u8>> {
    if total_splits <= 1 {
        return Ok(content.to_vec());
    }
    if current_split >= total_splits {
        return Err(LoadfleetError::Storage(format!(
            "split {current_split} out of range for {total_splits} splits"
        )));
    }
    let total = total_splits as usize;
    let current = current_split as usize;
    let mut out = Vec::with_capacity(content.len() / total + 1);
    for (n, line) in content.split_inclusive(|b| *b == b'\n').enumerate() {
        if n % total == current {
            out.extend_from_slice(line);
        }
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const USERS: &[u8] = b"alice\nbob\ncarol\ndave\neve\n";

    #[test]
    fn test_single_split_is_identity() {
        assert_eq!(split_csv(USERS, 1, 0).unwrap(), USERS);
        assert_eq!(split_csv(USERS, 0, 0).unwrap(), USERS);
    }

    #[test]
    fn test_round_robin_slices() {
        assert_eq!(split_csv(USERS, 2, 0).unwrap(), b"alice\ncarol\neve\n");
        assert_eq!(split_csv(USERS, 2, 1).unwrap(), b"bob\ndave\n");
    }

    #[test]
    fn test_slices_cover_every_line_once() {
        let total: usize = (0..3)
            .map(|i| split_csv(USERS, 3, i).unwrap().len())
            .sum();
        assert_eq!(total, USERS.len());
    }

    #[test]
    fn test_missing_trailing_newline() {
        assert_eq!(split_csv(b"a\nb\nc", 2, 0).unwrap(), b"a\nc");
    }

    #[test]
    fn test_out_of_range_split() {
        assert!(split_csv(USERS, 2, 2).is_err());
    }
}
