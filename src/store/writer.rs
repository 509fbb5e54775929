use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

type Responder = oneshot::Sender<io::Result<()>>;

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: Responder,
    },
    Compact {
        events: Vec<Event>,
        response: Responder,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends for group commit: block for the first
/// append, drain whatever else is already queued, fsync once, answer everyone.
pub(crate) async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_other(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Anything else must observe the batch already on disk.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_other(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, Responder)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = match wal.checkpoint() {
        Ok(cp) => {
            let appended = append_all(wal, batch);
            if let Err(e) = &appended {
                error!("WAL append failed for batch of {}: {e}", batch.len());
                // The batch is answered as failed, so none of it may survive on disk.
                if let Err(rewind) = wal.rewind(cp) {
                    error!("WAL rewind failed, refusing further appends: {rewind}");
                }
            }
            appended
        }
        Err(e) => {
            error!("WAL checkpoint failed, refusing further appends: {e}");
            wal.poison();
            Err(e)
        }
    };

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn append_all(wal: &mut Wal, batch: &[(Event, Responder)]) -> io::Result<()> {
    for (event, _) in batch {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn handle_other(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}
