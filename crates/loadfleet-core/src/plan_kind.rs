//! Load-generator kinds and the capability record each one resolves to.
//!
//! The rest of the system never branches on [`PlanKind`]; it looks up the
//! kind's [`PlanCapability`] once and calls through it.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::engine_config::PlanEnginesConfig;
use crate::error::{LoadfleetError, LoadfleetResult};

/// Which load generator executes a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    /// Apache JMeter (`.jmx`).
    Jmeter,
    /// Locust (`.py`).
    Locust,
}

impl PlanKind {
    /// Every supported kind.
    pub const ALL: [PlanKind; 2] = [PlanKind::Jmeter, PlanKind::Locust];

    /// The capability record for this kind.
    pub fn capability(self) -> &'static PlanCapability {
        match self {
            PlanKind::Jmeter => &JMETER,
            PlanKind::Locust => &LOCUST,
        }
    }

    /// Whether `filename` is an acceptable test script for this kind.
    pub fn is_valid_test_file(self, filename: &str) -> bool {
        filename.ends_with(self.capability().test_file_extension)
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanKind::Jmeter => write!(f, "jmeter"),
            PlanKind::Locust => write!(f, "locust"),
        }
    }
}

impl std::str::FromStr for PlanKind {
    type Err = LoadfleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jmeter" => Ok(PlanKind::Jmeter),
            "locust" => Ok(PlanKind::Locust),
            other => Err(LoadfleetError::Precondition(format!(
                "{other} is not a supported plan kind"
            ))),
        }
    }
}

/// A file produced by rendering a test script for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    /// File name to store the content under.
    pub filename: String,
    /// File content.
    pub content: Vec<u8>,
}

/// Renders an uploaded test script with the plan's run parameters.
pub type RenderFn = fn(&str, &[u8], &PlanEnginesConfig) -> LoadfleetResult<Vec<RenderedFile>>;

/// Fixed per-kind behaviour.
#[derive(Debug)]
pub struct PlanCapability {
    /// The kind this record describes.
    pub kind: PlanKind,
    /// Required test script extension, including the dot.
    pub test_file_extension: &'static str,
    /// Produces the files engines pull on start.
    pub render: RenderFn,
}

static JMETER: PlanCapability = PlanCapability {
    kind: PlanKind::Jmeter,
    test_file_extension: ".jmx",
    render: render_jmx,
};

static LOCUST: PlanCapability = PlanCapability {
    kind: PlanKind::Locust,
    test_file_extension: ".py",
    render: render_locust,
};

#[allow(clippy::expect_used)]
static THREAD_GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:Setup)?ThreadGroup\b[^>]*>.*?</(?:Setup)?ThreadGroup>")
        .expect("thread group pattern")
});

#[allow(clippy::expect_used)]
static THREAD_GROUP_PROP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<(\w+) name="ThreadGroup\.(duration|scheduler|num_threads|ramp_time)"([^>]*?)(?:/>|>[^<]*</\w+>)"#,
    )
    .expect("thread group property pattern")
});

#[allow(clippy::expect_used)]
static COMMENT_OR_CDATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--.*?-->|<!\[CDATA\[.*?\]\]>").expect("comment pattern")
});

/// The root element, past any XML declaration or doctype, must be a
/// `jmeterTestPlan` that wraps a `hashTree`. Comments and CDATA are ignored.
fn check_jmx_structure(doc: &str) -> Result<(), &'static str> {
    let stripped = COMMENT_OR_CDATA.replace_all(doc, "");
    let mut body = stripped.trim_start_matches('\u{feff}');
    loop {
        body = body.trim_start();
        let (open, close) = if body.starts_with("<?") {
            ("<?", "?>")
        } else if body.starts_with("<!DOCTYPE") {
            ("<!DOCTYPE", ">")
        } else {
            break;
        };
        let end = body[open.len()..]
            .find(close)
            .ok_or("unterminated XML declaration")?;
        body = &body[open.len() + end + close.len()..];
    }

    let root = body
        .strip_prefix("<jmeterTestPlan")
        .filter(|rest| rest.starts_with(|c: char| c.is_whitespace() || c == '>' || c == '/'))
        .ok_or("root element is not jmeterTestPlan")?;
    root.trim_end()
        .strip_suffix("</jmeterTestPlan>")
        .filter(|inner| inner.contains("<hashTree"))
        .map(|_| ())
        .ok_or("jmeterTestPlan has no hashTree")
}

fn render_jmx(
    filename: &str,
    content: &[u8],
    pec: &PlanEnginesConfig,
) -> LoadfleetResult<Vec<RenderedFile>> {
    let doc = std::str::from_utf8(content)
        .map_err(|e| LoadfleetError::Precondition(format!("{filename} is not valid UTF-8: {e}")))?;
    check_jmx_structure(doc).map_err(|why| {
        LoadfleetError::Precondition(format!("Missing Jmeter Test plan in {filename}: {why}"))
    })?;
    let duration_secs = (u64::from(pec.duration) * 60).to_string();
    let concurrency = pec.concurrency.to_string();
    let rampup = pec.rampup.to_string();

    let rendered = THREAD_GROUP.replace_all(doc, |group: &Captures| {
        THREAD_GROUP_PROP
            .replace_all(&group[0], |prop: &Captures| {
                let value = match &prop[2] {
                    "duration" => duration_secs.as_str(),
                    "scheduler" => "true",
                    "num_threads" => concurrency.as_str(),
                    _ => rampup.as_str(),
                };
                format!(
                    r#"<{tag} name="ThreadGroup.{name}"{attrs}>{value}</{tag}>"#,
                    tag = &prop[1],
                    name = &prop[2],
                    attrs = &prop[3],
                )
            })
            .into_owned()
    });

    Ok(vec![RenderedFile {
        filename: filename.to_string(),
        content: rendered.into_owned().into_bytes(),
    }])
}

/// Name of the generated locust configuration file.
pub const LOCUST_CONF: &str = "locust.conf";

fn render_locust(
    filename: &str,
    content: &[u8],
    pec: &PlanEnginesConfig,
) -> LoadfleetResult<Vec<RenderedFile>> {
    let mut script = content.to_vec();
    if !script.ends_with(b"\n") {
        script.push(b'\n');
    }
    // Results land in result.csv so the engine can tail them as metric lines.
    script.extend_from_slice(
        format!(
            "\nfrom locust_plugins.listeners import jmeter\n\
             @events.init.add_listener\n\
             def on_locust_init(environment, **kwargs):\n    \
             jmeter.JmeterListener(env=environment, testplan=\"{}\",\n        \
             flush_size=1, results_filename=\"test-result/result.csv\")\n",
            pec.name
        )
        .as_bytes(),
    );
    let conf = format!(
        "headless = true\nusers = {}\nrun-time = {}m\nspawn-rate = {}\n",
        pec.concurrency, pec.duration, pec.rampup
    );
    Ok(vec![
        RenderedFile {
            filename: filename.to_string(),
            content: script,
        },
        RenderedFile {
            filename: LOCUST_CONF.to_string(),
            content: conf.into_bytes(),
        },
    ])
}
