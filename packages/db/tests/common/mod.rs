use db::repositories::{JobRepository, JoinRepository, ProcessRepository, SyncQueueRepository};
use db::{Database, DbConfig, DbError};

/// Repositories over a fresh in-memory store.
pub struct TestStore {
    #[allow(dead_code)]
    pub db: Database,
    pub jobs: JobRepository,
    pub queues: SyncQueueRepository,
    pub joins: JoinRepository,
    pub processes: ProcessRepository,
}

pub async fn setup_db() -> Result<TestStore, DbError> {
    let db = db::init(&DbConfig::memory()).await?;
    Ok(TestStore {
        jobs: JobRepository::new(db.clone()),
        queues: SyncQueueRepository::new(db.clone()),
        joins: JoinRepository::new(db.clone()),
        processes: ProcessRepository::new(db.clone()),
        db,
    })
}
