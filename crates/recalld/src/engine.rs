use recall_core::{
    DetailsPatch, EnrollError, Filter, IdentifyOutcome, IdentityRecord, ImageInput,
    MemberDetails, RecallService, ServiceError, StoreError,
};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// A unit of blocking work run on an engine worker. Each job owns the
/// sender for its reply.
type Job = Box<dyn FnOnce(&RecallService) + Send>;

/// Clone-safe handle to the engine workers.
///
/// Every workflow spawns helper processes and touches SQLite, so it runs on
/// a dedicated OS thread. D-Bus handlers only await the reply.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Job>,
}

impl EngineHandle {
    async fn call<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&RecallService) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |service| {
            let _ = reply_tx.send(work(service));
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn enroll(
        &self,
        account: String,
        name: String,
        details: MemberDetails,
        image: ImageInput,
    ) -> Result<IdentityRecord, EngineError> {
        Ok(self
            .call(move |svc| svc.enroll(&account, &name, details, &image))
            .await??)
    }

    pub async fn identify(
        &self,
        account: String,
        image: ImageInput,
    ) -> Result<IdentifyOutcome, EngineError> {
        Ok(self.call(move |svc| svc.identify(&account, &image)).await??)
    }

    pub async fn list(
        &self,
        account: String,
        filter: Filter,
    ) -> Result<Vec<IdentityRecord>, EngineError> {
        Ok(self.call(move |svc| svc.list(&account, &filter)).await??)
    }

    pub async fn search(
        &self,
        account: String,
        query: String,
    ) -> Result<Vec<IdentityRecord>, EngineError> {
        Ok(self.call(move |svc| svc.search(&account, &query)).await??)
    }

    pub async fn get(&self, account: String, id: String) -> Result<IdentityRecord, EngineError> {
        Ok(self.call(move |svc| svc.get(&account, &id)).await??)
    }

    pub async fn update(
        &self,
        account: String,
        id: String,
        patch: DetailsPatch,
    ) -> Result<IdentityRecord, EngineError> {
        Ok(self
            .call(move |svc| svc.update(&account, &id, &patch))
            .await??)
    }

    pub async fn remove(&self, account: String, id: String) -> Result<(), EngineError> {
        Ok(self.call(move |svc| svc.remove(&account, &id)).await??)
    }
}

/// Spawn `workers` OS threads sharing one job queue over `service`.
///
/// A panicking job is logged and its caller sees `ChannelClosed`; the
/// worker keeps serving.
pub fn spawn_engine(service: RecallService, workers: usize) -> std::io::Result<EngineHandle> {
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel::<Job>(workers * 4);
    let rx = Arc::new(Mutex::new(rx));
    let service = Arc::new(service);

    for n in 0..workers {
        let rx = Arc::clone(&rx);
        let service = Arc::clone(&service);
        std::thread::Builder::new()
            .name(format!("recall-engine-{n}"))
            .spawn(move || {
                tracing::info!(worker = n, "engine worker started");
                loop {
                    let job = match rx.lock() {
                        Ok(mut rx) => rx.blocking_recv(),
                        Err(_) => break,
                    };
                    let Some(job) = job else { break };
                    let svc: &RecallService = &service;
                    if std::panic::catch_unwind(AssertUnwindSafe(|| job(svc))).is_err() {
                        tracing::error!(worker = n, "engine job panicked");
                    }
                }
                tracing::info!(worker = n, "engine worker exiting");
            })?;
    }

    Ok(EngineHandle { tx })
}
