use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{encode, CommandRecord, Token},
    error::{Error, Result},
    pending::{ConnectionState, PendingReply, PendingTable},
    response::{decode, ReplyRecord},
    task::BackgroundTask,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Correlates commands written to the daemon with the replies it emits.
///
/// Any number of callers may submit concurrently. Lines are written one at a
/// time and a single background listener owns the read side.
pub(crate) struct Multiplexer {
    table: Arc<PendingTable>,
    writer: Arc<Mutex<BoxedWriter>>,
    listener: BackgroundTask,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Starts the listener on `reader`. It also stops once `exited` fires.
    pub(crate) fn new<R, W>(reader: R, writer: W, exited: CancellationToken) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let table = Arc::new(PendingTable::new());
        let listener = BackgroundTask::new();
        let listener_table = Arc::clone(&table);
        listener.spawn(move |shutdown| {
            Listener::new(reader, listener_table).listen(shutdown, exited)
        });

        Self {
            table,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            listener,
        }
    }

    /// Registers `command` under a fresh token and writes it.
    ///
    /// The returned handle resolves once the matching reply is read.
    pub(crate) async fn issue(&self, command: &CommandRecord) -> Result<PendingReply> {
        let (token, rx) = self.table.register()?;
        let pending = PendingReply::new(token, rx, Arc::clone(&self.table));
        let line = encode(token, command);
        trace!("-> {}", line.trim_end());

        // Detached so that dropping this future cannot leave half a line on the pipe.
        let writer = Arc::clone(&self.writer);
        let written = tokio::task::spawn(async move {
            let mut writer = writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await
        .map_err(std::io::Error::from)
        .and_then(|written| written);

        written
            .map(|()| pending)
            .map_err(|err| Error::Process(format!("failed to send command, reason: {}", err)))
    }

    pub(crate) async fn submit(&self, command: &CommandRecord) -> Result<ReplyRecord> {
        self.issue(command).await?.await
    }

    pub(crate) fn cancel(&self, token: Token) -> bool {
        self.table.cancel(token)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.table.state()
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.table.outstanding()
    }

    /// Refuses new commands.
    pub(crate) fn begin_close(&self) {
        self.table.begin_close();
    }

    /// Closes the write side unless a write is still in progress.
    ///
    /// A write blocked on a peer that stopped reading holds the writer, so
    /// this never waits for it.
    pub(crate) async fn close_input(&self) {
        let mut writer = match self.writer.try_lock() {
            Ok(writer) => writer,
            Err(_) => {
                debug!("command stream busy, leaving it open");
                return;
            }
        };
        if let Err(err) = writer.shutdown().await {
            debug!("failed to close command stream, reason: {}", err);
        }
    }

    /// Fails whatever is still outstanding and stops the listener.
    pub(crate) async fn shutdown(&self, reason: &str) {
        let failed = self.table.close(reason);
        if failed > 0 {
            debug!("failed {} outstanding requests: {}", failed, reason);
        }
        self.listener.cancel();
        self.listener.join().await;
    }
}

struct Listener<R> {
    lines: Lines<BufReader<R>>,
    table: Arc<PendingTable>,
}

impl<R: AsyncRead + Unpin> Listener<R> {
    fn new(reader: R, table: Arc<PendingTable>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            table,
        }
    }

    async fn listen(mut self, shutdown: CancellationToken, exited: CancellationToken) {
        let reason = loop {
            let line = tokio::select! {
                biased;
                line = self.lines.next_line() => line,
                _ = exited.cancelled() => break "probe process exited".to_string(),
                _ = shutdown.cancelled() => break "connection closed".to_string(),
            };
            match line {
                Ok(Some(line)) => self.dispatch(&line),
                Ok(None) => break "probe process closed its output".to_string(),
                Err(err) => {
                    break format!("failed to read from probe process, reason: {}", err)
                }
            }
        };
        let failed = self.table.close(&reason);
        debug!("listener stopped ({}), failed {} outstanding requests", reason, failed);
    }

    fn dispatch(&self, line: &str) {
        trace!("<- {}", line);
        if line.trim().is_empty() {
            return;
        }
        let (token, result) = match decode(line) {
            Ok(record) => (record.token, Ok(record)),
            Err(err) => {
                warn!("{}", err);
                match err.token {
                    Some(token) => (token, Err(Error::Protocol(err))),
                    None => return,
                }
            }
        };
        if !self.table.resolve(token, result) {
            debug!("discarding reply for unknown or cancelled token {}", token);
        }
    }
}
