use std::io;
use std::sync::{Arc, OnceLock};

use cachegate::logging::RecentLog;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{self, MakeWriter};

/// Raw bytes written by the test subscriber since the last [`LogCapture`].
#[derive(Clone, Default)]
struct CapturedBytes(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedBytes {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedBytes {
    type Writer = CapturedBytes;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

struct Sinks {
    bytes: CapturedBytes,
    recent: RecentLog,
}

static SINKS: OnceLock<Sinks> = OnceLock::new();
static EXCLUSIVE: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// Exclusive view of the process-wide test subscriber. The first capture
/// installs it with `filter`; later captures reuse it. Output is also teed
/// into a [`RecentLog`] that engines can be handed.
pub struct LogCapture {
    sinks: &'static Sinks,
    _permit: OwnedSemaphorePermit,
}

impl LogCapture {
    pub async fn new(filter: &str) -> Self {
        let permit = EXCLUSIVE
            .get_or_init(|| Arc::new(Semaphore::new(1)))
            .clone()
            .acquire_owned()
            .await
            .expect("log capture semaphore closed");
        let sinks = SINKS.get_or_init(|| install(filter));
        sinks.bytes.0.lock().clear();
        Self {
            sinks,
            _permit: permit,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.sinks.bytes.0.lock()).into_owned()
    }

    pub fn recent(&self) -> RecentLog {
        self.sinks.recent.clone()
    }
}

fn install(filter: &str) -> Sinks {
    let sinks = Sinks {
        bytes: CapturedBytes::default(),
        recent: RecentLog::new(256),
    };
    let subscriber = fmt::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(false)
        .compact()
        .with_writer(sinks.bytes.clone().and(sinks.recent.clone()))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    sinks
}
