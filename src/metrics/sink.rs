use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use super::MetricsRecord;
use crate::config::SinkKind;

/// Destination of metric records. Records must be kept in the order they are logged.
pub trait MetricsSink: Send {
    fn log(&mut self, record: &MetricsRecord, step: u64) -> io::Result<()>;

    /// Forgets every record logged after `step`, the step training continues from.
    /// A fresh start passes 0.
    fn resume(&mut self, _step: u64) -> io::Result<()> {
        Ok(())
    }

    /// Flushes everything logged so far. The sink is not used afterwards.
    fn close(&mut self) -> io::Result<()>;
}

/// Creates the sink `kind` names for the process with `rank`.
pub fn build_sink(
    kind: SinkKind,
    dump_folder: &Path,
    rank: usize,
) -> io::Result<Box<dyn MetricsSink>> {
    Ok(match kind {
        SinkKind::Jsonl => Box::new(JsonlSink::create(dump_folder, rank)?),
        SinkKind::Log => Box::new(LogSink::new(rank)),
    })
}

#[derive(Serialize)]
struct Line<'a> {
    step: u64,
    #[serde(flatten)]
    record: &'a MetricsRecord,
}

#[derive(Deserialize)]
struct LineStep {
    step: u64,
}

/// One JSON object per record, at `{dump_folder}/metrics/rank-{rank}.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dump_folder: &Path, rank: usize) -> io::Result<Self> {
        let dir = dump_folder.join("metrics");
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("rank-{rank}.jsonl"));
        let file = File::options().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn log(&mut self, record: &MetricsRecord, step: u64) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &Line { step, record })?;
        self.writer.write_all(b"\n")
    }

    /// Rewrites the file without the records a resumed run is about to log again. Torn
    /// lines from a crash are dropped too.
    fn resume(&mut self, step: u64) -> io::Result<()> {
        self.writer.flush()?;

        let text = fs::read_to_string(&self.path)?;
        let mut kept = String::with_capacity(text.len());
        for line in text.lines() {
            if serde_json::from_str::<LineStep>(line).is_ok_and(|l| l.step <= step) {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        // Opened in append mode, so writes land after the truncation point.
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.write_all(kept.as_bytes())?;
        file.sync_all()
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// Writes records through the `log` facade.
#[derive(Debug)]
pub struct LogSink {
    rank: usize,
}

impl LogSink {
    pub fn new(rank: usize) -> Self {
        Self { rank }
    }
}

impl MetricsSink for LogSink {
    fn log(&mut self, record: &MetricsRecord, step: u64) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        info!(rank = self.rank, step = step; "metrics {line}");
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_keeps_order_and_appends() {
        let dir = tempfile::tempdir().unwrap();

        let mut sink = JsonlSink::create(dir.path(), 2).unwrap();
        for step in [1, 6] {
            let mut record = MetricsRecord::new();
            record.insert("wps", 100.0 * step as f64);
            record.insert("loss_metrics/global_avg_loss", 1.0 / step as f64);
            sink.log(&record, step).unwrap();
        }
        sink.close().unwrap();

        let mut again = JsonlSink::create(dir.path(), 2).unwrap();
        again.log(&MetricsRecord::new(), 11).unwrap();
        again.close().unwrap();

        let text = fs::read_to_string(dir.path().join("metrics/rank-2.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["step"], 1);
        assert_eq!(lines[0]["wps"], 100.0);
        assert_eq!(lines[1]["step"], 6);
        assert_eq!(lines[1]["wps"], 600.0);
        assert_eq!(lines[2]["step"], 11);
    }

    #[test]
    fn resume_drops_records_past_the_restored_step() {
        let dir = tempfile::tempdir().unwrap();

        let mut sink = JsonlSink::create(dir.path(), 0).unwrap();
        for step in [1, 6, 11, 16] {
            sink.log(&MetricsRecord::new(), step).unwrap();
        }
        sink.close().unwrap();
        let mut text = fs::read_to_string(sink.path()).unwrap();
        text.push_str("{\"step\": 2");
        fs::write(sink.path(), text).unwrap();

        let mut resumed = JsonlSink::create(dir.path(), 0).unwrap();
        resumed.resume(10).unwrap();
        resumed.log(&MetricsRecord::new(), 11).unwrap();
        resumed.close().unwrap();

        let steps: Vec<u64> = fs::read_to_string(resumed.path())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<LineStep>(l).unwrap().step)
            .collect();
        assert_eq!(steps, vec![1, 6, 11]);
    }

    #[test]
    fn log_sink_accepts_records() {
        let mut sink = build_sink(SinkKind::Log, Path::new("/nonexistent"), 0).unwrap();
        let mut record = MetricsRecord::new();
        record.insert("wps", 1.0);
        sink.log(&record, 1).unwrap();
        sink.close().unwrap();
    }
}
