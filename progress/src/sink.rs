use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// One emitted stats record.
#[derive(Debug)]
pub struct Record<'a> {
    pub epoch: u64,
    pub tag: &'a str,
    pub step: u64,
    pub position: usize,
    pub total: Option<usize>,
    pub stats: &'a BTreeMap<String, f64>,
    /// End-of-epoch summary rather than a mid-epoch sample.
    pub summary: bool,
}

/// Output destination for aggregated stats.
///
/// Sinks never mutate training state; an emit failure is logged and
/// swallowed so reporting problems cannot kill a run.
pub trait Sink: Send {
    fn emit(&mut self, record: &Record<'_>);
}

/// Human-readable lines through the logger.
pub struct ConsoleSink;

impl Sink for ConsoleSink {
    fn emit(&mut self, record: &Record<'_>) {
        let mut line = String::new();
        for (key, value) in record.stats {
            line.push_str(&format!(" | {key} {value:.3}"));
        }

        let position = match record.total {
            Some(total) => format!("{}/{total}", record.position),
            None => record.position.to_string(),
        };

        if record.summary {
            log::info!("epoch {:03} | {}{line}", record.epoch, record.tag);
        } else {
            log::info!(
                "epoch {:03} | {} {position}{line}",
                record.epoch,
                record.tag
            );
        }
    }
}

/// One JSON object per record on stdout, machine-consumable.
pub struct JsonSink;

impl Sink for JsonSink {
    fn emit(&mut self, record: &Record<'_>) {
        println!("{}", render_json(record));
    }
}

fn render_json(record: &Record<'_>) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("epoch".to_string(), record.epoch.into());
    obj.insert("tag".to_string(), record.tag.into());
    obj.insert("step".to_string(), record.step.into());
    for (key, value) in record.stats {
        obj.insert(key.clone(), (*value).into());
    }
    serde_json::Value::Object(obj).to_string()
}

/// Dashboard spool: appends run-tagged records under
/// `<save_dir>/dashboard/<run_name>.jsonl` for an external uploader.
///
/// Only constructed when a project is configured; an absent project means
/// the sink simply does not exist, never an error.
pub struct DashboardSink {
    project: String,
    entity: Option<String>,
    run_name: String,
    file: File,
}

impl DashboardSink {
    pub fn create(
        project: &str,
        entity: Option<&str>,
        run_name: &str,
        save_dir: &Path,
    ) -> io::Result<Self> {
        let dir = save_dir.join("dashboard");
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{run_name}.jsonl")))?;

        Ok(Self {
            project: project.to_string(),
            entity: entity.map(str::to_string),
            run_name: run_name.to_string(),
            file,
        })
    }
}

impl Sink for DashboardSink {
    fn emit(&mut self, record: &Record<'_>) {
        let mut obj = serde_json::Map::new();
        obj.insert("project".to_string(), self.project.clone().into());
        if let Some(entity) = &self.entity {
            obj.insert("entity".to_string(), entity.clone().into());
        }
        obj.insert("run".to_string(), self.run_name.clone().into());
        obj.insert("epoch".to_string(), record.epoch.into());
        obj.insert("tag".to_string(), record.tag.into());
        obj.insert("step".to_string(), record.step.into());
        for (key, value) in record.stats {
            obj.insert(key.clone(), (*value).into());
        }

        let line = serde_json::Value::Object(obj).to_string();
        if let Err(e) = writeln!(self.file, "{line}") {
            log::warn!("dashboard sink write failed: {e}");
        }
    }
}
