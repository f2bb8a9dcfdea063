//! Access-log sinks, invoked once per active message at reset.

use std::io::Write;
use std::sync::Mutex;

use crate::filter::stream_info::StreamInfo;
use crate::route::RouteHeaders;

pub trait AccessLog: Send + Sync {
    fn log(&self, headers: Option<&RouteHeaders>, info: &StreamInfo);
}

/// Emits one structured record per request into the main log stream.
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn log(&self, headers: Option<&RouteHeaders>, info: &StreamInfo) {
        let path = headers.map(|h| h.path()).unwrap_or("-");
        let authority = headers.map(|h| h.authority()).unwrap_or("-");

        tracing::info!(
            client = %info.downstream_remote,
            authority = %authority,
            path = %path,
            response_code = info.response_code().unwrap_or(0),
            flags = %info.response_flags_string(),
            bytes_received = info.bytes_received(),
            bytes_sent = info.bytes_sent(),
            upstream_cluster = info.upstream_cluster().unwrap_or("-"),
            upstream_host = info.upstream_host().unwrap_or("-"),
            duration_ms = info.duration().as_millis() as u64,
            "access"
        );
    }
}

/// Writes one line per request to a dedicated file through a non-blocking
/// appender. The worker guard is held for the process lifetime.
pub struct FileAccessLog {
    writer: Mutex<tracing_appender::non_blocking::NonBlocking>,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

impl FileAccessLog {
    pub fn new(path: &std::path::Path) -> anyhow::Result<Self> {
        let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("access log path has no file name"))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        Ok(Self {
            writer: Mutex::new(writer),
            _guard: guard,
        })
    }
}

impl AccessLog for FileAccessLog {
    fn log(&self, headers: Option<&RouteHeaders>, info: &StreamInfo) {
        let path = headers.map(|h| h.path()).unwrap_or("-");
        let authority = headers.map(|h| h.authority()).unwrap_or("-");
        let request_id = headers
            .and_then(|h| h.get(crate::route::HEADER_REQUEST_ID))
            .unwrap_or("-");

        let line = format!(
            "{client} {authority} {path} {request_id} {code} {flags} {rx} {tx} {cluster} {host} {ms}\n",
            client = info.downstream_remote,
            authority = authority,
            path = path,
            request_id = request_id,
            code = info.response_code().unwrap_or(0),
            flags = info.response_flags_string(),
            rx = info.bytes_received(),
            tx = info.bytes_sent(),
            cluster = info.upstream_cluster().unwrap_or("-"),
            host = info.upstream_host().unwrap_or("-"),
            ms = info.duration().as_millis(),
        );

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
        }
    }
}
