//! NDJSON event sink: one decoded [`Event`] per line, either to stdout or to
//! a configured file, mirroring the teacher's `JsonlHandler` append-only
//! writer.

use podtrace_common::Event;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};

/// What actually goes out on the wire: the fixed event record plus the raw
/// instruction pointers from its stack-trace sideband, when one was
/// captured. Symbol resolution of those addresses is explicitly left to a
/// downstream tool.
#[derive(Serialize)]
pub struct EventRecord<'a> {
    #[serde(flatten)]
    pub event: &'a Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<&'a [u64]>,
}

pub enum EventSink {
    Stdout(Stdout),
    File(BufWriter<tokio::fs::File>),
}

impl EventSink {
    pub async fn open(path: Option<&str>) -> std::io::Result<Self> {
        match path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path).await?;
                Ok(Self::File(BufWriter::new(file)))
            }
            None => Ok(Self::Stdout(tokio::io::stdout())),
        }
    }

    pub async fn write_record(&mut self, record: &EventRecord<'_>) {
        let Ok(json) = serde_json::to_string(record) else {
            return;
        };
        let _ = match self {
            Self::Stdout(out) => out.write_all(json.as_bytes()).await,
            Self::File(out) => out.write_all(json.as_bytes()).await,
        };
        let _ = match self {
            Self::Stdout(out) => out.write_all(b"\n").await,
            Self::File(out) => out.write_all(b"\n").await,
        };
        if let Self::File(out) = self {
            let _ = out.flush().await;
        }
    }
}
