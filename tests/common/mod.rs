//! Shared fixtures: a SQLite-backed repository in a temp dir, wrapped in a
//! connector that counts lifecycle calls and can fail chosen round trips.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use programdb::store::{Key, ScanPage, SqliteStore, TransactItem, WriteRequest};
use programdb::{
    Connector, EditRecord, ProgramRepository, ProgramStatus, SqliteConnector, StoreConfig,
    StoreError, TableStore,
};

pub const MAX_PROGRAMS: usize = 5;

/// Which round trip should fail. Call numbers are 1-based and counted across
/// every store opened through the same connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Connect,
    Scan(usize),
    Batch(usize),
    Transaction(usize),
}

#[derive(Default)]
pub struct Probe {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub scans: AtomicUsize,
    pub batches: AtomicUsize,
    pub transactions: AtomicUsize,
    fail: Mutex<Option<FailOn>>,
}

impl Probe {
    pub fn fail_on(&self, plan: FailOn) {
        *self.fail.lock().unwrap() = Some(plan);
    }

    pub fn clear(&self) {
        *self.fail.lock().unwrap() = None;
        for counter in [&self.scans, &self.batches, &self.transactions] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn should_fail(&self, plan: FailOn) -> bool {
        *self.fail.lock().unwrap() == Some(plan)
    }

    fn tick(counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Unavailable(format!("injected {what} failure"))
}

#[derive(Clone)]
pub struct FaultyConnector {
    pub probe: Arc<Probe>,
}

impl Connector for FaultyConnector {
    type Store = FaultyStore;

    async fn connect(&self, config: &StoreConfig) -> Result<FaultyStore, StoreError> {
        Probe::tick(&self.probe.opens);
        if self.probe.should_fail(FailOn::Connect) {
            return Err(injected("connect"));
        }
        let inner = SqliteConnector.connect(config).await?;
        Ok(FaultyStore {
            inner,
            probe: self.probe.clone(),
            closed: false,
        })
    }
}

pub struct FaultyStore {
    inner: SqliteStore,
    probe: Arc<Probe>,
    closed: bool,
}

impl TableStore for FaultyStore {
    async fn scan(
        &mut self,
        table: &str,
        exclusive_start_key: Option<Key>,
    ) -> Result<ScanPage, StoreError> {
        let call = Probe::tick(&self.probe.scans);
        if self.probe.should_fail(FailOn::Scan(call)) {
            return Err(injected("scan"));
        }
        self.inner.scan(table, exclusive_start_key).await
    }

    async fn batch_write(
        &mut self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> Result<(), StoreError> {
        let call = Probe::tick(&self.probe.batches);
        if self.probe.should_fail(FailOn::Batch(call)) {
            return Err(injected("batch"));
        }
        self.inner.batch_write(table, requests).await
    }

    async fn transact_write(&mut self, items: Vec<TransactItem>) -> Result<(), StoreError> {
        let call = Probe::tick(&self.probe.transactions);
        if self.probe.should_fail(FailOn::Transaction(call)) {
            return Err(injected("transaction"));
        }
        self.inner.transact_write(items).await
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            Probe::tick(&self.probe.closes);
        }
        self.inner.close();
    }
}

pub struct Fixture {
    pub repo: ProgramRepository<FaultyConnector>,
    pub probe: Arc<Probe>,
    pub db_path: PathBuf,
    _dir: tempfile::TempDir,
}

/// Repository over a fresh database, scanning two items per page so that
/// pagination is exercised by every test.
pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("programs.sqlite3");
    let config = StoreConfig::builder()
        .stage("test")
        .service("recorder")
        .max_programs(MAX_PROGRAMS)
        .scan_page_size(2)
        .endpoint(db_path.clone())
        .build()
        .unwrap();

    let probe = Arc::new(Probe::default());
    let repo = ProgramRepository::with_connector(
        config,
        FaultyConnector {
            probe: probe.clone(),
        },
    );
    Fixture {
        repo,
        probe,
        db_path,
        _dir: dir,
    }
}

pub fn program(pid: &str, title: &str) -> EditRecord {
    let mut record = EditRecord::new(pid, title);
    record.genre = "drama".into();
    record.quality = "HD".into();
    record.synopsis = format!("Synopsis of {title}");
    record.image_uri = format!("https://img.example/{pid}.jpg");
    record.status = ProgramStatus::Pending;
    record
}
