//! Single-writer actor serializing all mutations.
//!
//! SQLite allows one writer at a time; funnelling every write through one
//! dedicated thread avoids `SQLITE_BUSY` churn under concurrent staging and
//! drain activity. Each job runs inside one immediate transaction, so a
//! record write and its queue write commit or roll back together.

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use log::error;
use tokio::sync::{mpsc, oneshot};

use casework_core::errors::{Error, Result};

use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

/// Carries either a domain error or a diesel error out of the transaction
/// closure; `immediate_transaction` needs `From<diesel::result::Error>`.
enum TxError {
    Domain(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Diesel(err)
    }
}

impl From<TxError> for Error {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Domain(e) => e,
            TxError::Diesel(e) => StorageError::from(e).into(),
        }
    }
}

impl WriteHandle {
    /// Run a write job on the writer thread inside one immediate transaction.
    /// Returning `Err` from the job rolls the whole transaction back.
    pub async fn exec<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<Result<T>>();
        let wrapped: Job = Box::new(move |conn| {
            let result = conn
                .immediate_transaction::<T, TxError, _>(|tx| job(tx).map_err(TxError::Domain))
                .map_err(Error::from);
            let _ = done_tx.send(result);
        });

        self.tx
            .send(wrapped)
            .map_err(|_| StorageError::WriterGone("write actor has shut down".to_string()))?;
        done_rx
            .await
            .map_err(|_| StorageError::WriterGone("write actor dropped the job".to_string()))?
    }
}

/// Spawn the writer thread. The handle is cheap to clone; dropping every
/// handle shuts the thread down once queued jobs finish.
pub fn spawn_writer(pool: Pool<ConnectionManager<SqliteConnection>>) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    std::thread::spawn(move || {
        while let Some(job) = rx.blocking_recv() {
            match pool.get() {
                Ok(mut conn) => job(&mut conn),
                Err(e) => {
                    // The job's oneshot sender is dropped without a response;
                    // the caller sees WriterGone.
                    error!("[CaseSync] Writer could not obtain a connection: {}", e);
                }
            }
        }
    });
    WriteHandle { tx }
}
