use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::{mapref::entry::Entry, DashMap};
use fedgeo_core::{
    BucketId, Circle, QueryKind, QueryShape, Record, Rectangle, SiloId, SpatialQuery,
    RECORD_WIRE_BYTES,
};
use fedgeo_crypto::{EncryptedRecord, PayloadCipher, PayloadKey};
use fedgeo_dp::NoiseSampler;
use fedgeo_grid::{GridConfig, GridIndex};
use fedgeo_networking::{IndexMetadata, SessionId};
use fedgeo_telemetry::{QueryLog, TelemetryHandle};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::SiloError;

/// Construction parameters for a [`Silo`].
#[derive(Clone, Debug)]
pub struct SiloOptions {
    pub silo_id: SiloId,
    pub grid: GridConfig,
    /// Seed for the silo's noise and shuffle stream; fresh entropy when unset.
    pub seed: Option<[u8; 32]>,
    /// Payload key material; `None` disables the encrypted release path.
    pub encryption: Option<PayloadKey>,
    pub max_open_sessions: usize,
}

impl SiloOptions {
    pub fn new(silo_id: SiloId, grid: GridConfig) -> Self {
        Self {
            silo_id,
            grid,
            seed: None,
            encryption: None,
            max_open_sessions: 1024,
        }
    }
}

struct OpenSession {
    opened: u64,
    buckets: Vec<BucketId>,
}

struct Encryption {
    key: PayloadKey,
    cipher: PayloadCipher,
}

/// One data holder: a record partition, the grid built over it with
/// perturbed counts, and the per-query candidate sets awaiting release.
pub struct Silo {
    id: SiloId,
    index: GridIndex,
    sessions: DashMap<SessionId, OpenSession>,
    session_seq: AtomicU64,
    max_open_sessions: usize,
    noise: Mutex<NoiseSampler>,
    encryption: Option<Encryption>,
    dummy_coords: (f32, f32),
    telemetry: TelemetryHandle,
    query_log: QueryLog,
}

impl Silo {
    pub fn build(
        records: Vec<Record>,
        options: SiloOptions,
        telemetry: TelemetryHandle,
    ) -> Result<Self, SiloError> {
        options.grid.validate().map_err(SiloError::Configuration)?;
        if options.max_open_sessions == 0 {
            return Err(SiloError::Configuration(
                "max open sessions must be greater than zero".into(),
            ));
        }
        check_records(&records)?;
        let mut noise = match options.seed {
            Some(seed) => NoiseSampler::from_seed(seed),
            None => NoiseSampler::from_entropy(),
        };
        let mut index = GridIndex::build(records, options.grid.k)?;
        index.perturb_counts(options.grid.epsilon, options.grid.noise_cap, &mut noise)?;
        let encryption = options
            .encryption
            .map(|key| PayloadCipher::new(&key).map(|cipher| Encryption { key, cipher }))
            .transpose()?;
        let dummy_coords = dummy_coordinates(&index);
        info!(
            silo = options.silo_id,
            records = index.records().len(),
            buckets = index.num_buckets(),
            encryption = encryption.is_some(),
            "silo ready"
        );
        Ok(Self {
            id: options.silo_id,
            index,
            sessions: DashMap::new(),
            session_seq: AtomicU64::new(0),
            max_open_sessions: options.max_open_sessions,
            noise: Mutex::new(noise),
            encryption,
            dummy_coords,
            telemetry,
            query_log: QueryLog::new()?,
        })
    }

    pub fn id(&self) -> SiloId {
        self.id
    }

    pub fn index(&self) -> &GridIndex {
        &self.index
    }

    pub fn query_log(&self) -> &QueryLog {
        &self.query_log
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn index_metadata(&self) -> IndexMetadata {
        IndexMetadata {
            silo_id: self.id,
            geometry: self.index.geometry().clone(),
            noisy_counts: self.index.noisy_counts().to_vec(),
        }
    }

    /// Stores the candidate set for `session`. Duplicate ids collapse to one.
    pub fn set_candidate_buckets(
        &self,
        session: SessionId,
        mut buckets: Vec<BucketId>,
    ) -> Result<(), SiloError> {
        let total = self.index.num_buckets();
        if let Some(bad) = buckets.iter().find(|id| **id as usize >= total) {
            return Err(SiloError::UnknownBucket {
                bucket: *bad,
                buckets: total,
            });
        }
        buckets.sort_unstable();
        buckets.dedup();
        if self.sessions.contains_key(&session) {
            return Err(SiloError::SessionInUse(session));
        }
        if self.sessions.len() >= self.max_open_sessions {
            self.evict_oldest_session();
        }
        match self.sessions.entry(session) {
            Entry::Occupied(_) => Err(SiloError::SessionInUse(session)),
            Entry::Vacant(slot) => {
                debug!(silo = self.id, %session, buckets = buckets.len(), "candidate set stored");
                slot.insert(OpenSession {
                    opened: self.session_seq.fetch_add(1, Ordering::Relaxed),
                    buckets,
                });
                Ok(())
            }
        }
    }

    /// Releases exactly `max(0, noisyCount)` records per candidate bucket:
    /// a uniform subsample of the real records when the bucket holds more,
    /// dummies padding it when it holds fewer. Consumes the session.
    pub fn release_candidate_records(&self, session: SessionId) -> Result<Vec<Record>, SiloError> {
        let timer = self.query_log.start();
        let (_, open) = self
            .sessions
            .remove(&session)
            .ok_or(SiloError::UnknownSession(session))?;

        let mut released = Vec::new();
        let (mut dummies, mut withheld) = (0u64, 0u64);
        let mut noise = self.noise.lock();
        for bucket in open.buckets {
            let n = self.index.perturbed_count(bucket).unwrap_or(0).max(0) as usize;
            let mut real: Vec<Record> = self
                .index
                .bucket_records(bucket)
                .map(|records| records.copied().collect())
                .unwrap_or_default();
            let t = real.len();
            if t > n {
                real.shuffle(noise.rng_mut());
                real.truncate(n);
                withheld += (t - n) as u64;
            }
            released.extend(real);
            if t < n {
                let (x, y) = self.dummy_coords;
                released.extend(std::iter::repeat(Record::dummy(x, y)).take(n - t));
                dummies += (n - t) as u64;
            }
        }
        released.shuffle(noise.rng_mut());
        drop(noise);

        self.telemetry
            .record_counter("silo.released", released.len() as u64)?;
        self.telemetry.record_counter("silo.dummies", dummies)?;
        self.telemetry.record_counter("silo.withheld", withheld)?;
        let elapsed = self
            .query_log
            .finish(timer, (released.len() * RECORD_WIRE_BYTES) as u64);
        self.telemetry
            .record_latency_ms("silo.release", elapsed.as_millis() as u64);
        debug!(
            silo = self.id,
            %session,
            released = released.len(),
            dummies,
            withheld,
            "candidate records released"
        );
        Ok(released)
    }

    /// Same release as [`Self::release_candidate_records`], sealed under the
    /// silo's payload key with the session bound as associated data.
    pub fn release_encrypted_candidate_records(
        &self,
        session: SessionId,
    ) -> Result<Vec<EncryptedRecord>, SiloError> {
        let encryption = self.encryption.as_ref().ok_or(SiloError::EncryptionDisabled)?;
        let aad = session.aad();
        self.release_candidate_records(session)?
            .iter()
            .map(|record| encryption.cipher.seal(record, &aad).map_err(SiloError::from))
            .collect()
    }

    pub fn encryption_key(&self) -> Result<PayloadKey, SiloError> {
        self.encryption
            .as_ref()
            .map(|encryption| encryption.key.clone())
            .ok_or(SiloError::EncryptionDisabled)
    }

    pub fn answer_circle(&self, circle: &Circle) -> Vec<Record> {
        let timer = self.query_log.start();
        let hits = self.index.range_query(circle);
        self.query_log
            .finish(timer, (hits.len() * RECORD_WIRE_BYTES) as u64);
        hits
    }

    pub fn answer_rectangle(&self, rect: &Rectangle) -> Vec<Record> {
        let timer = self.query_log.start();
        let hits = self.index.range_query_rect(rect);
        self.query_log
            .finish(timer, (hits.len() * RECORD_WIRE_BYTES) as u64);
        hits
    }

    pub fn answer_range_count(&self, query: &SpatialQuery) -> Result<u64, SiloError> {
        if query.kind == QueryKind::DistanceJoin {
            return Err(SiloError::UnsupportedQuery(query.kind));
        }
        let hits = match &query.shape {
            QueryShape::Circle(circle) => self.answer_circle(circle),
            QueryShape::Rectangle(rect) => self.answer_rectangle(rect),
        };
        Ok(hits.len() as u64)
    }

    fn evict_oldest_session(&self) {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| entry.value().opened)
            .map(|entry| *entry.key());
        if let Some(session) = oldest {
            self.sessions.remove(&session);
            warn!(silo = self.id, %session, "evicted abandoned candidate session");
        }
    }
}

/// Genuine ids are non-negative and unique within the silo; coordinates
/// are finite.
fn check_records(records: &[Record]) -> Result<(), SiloError> {
    let mut ids = HashSet::with_capacity(records.len());
    for record in records {
        if record.id < 0 {
            return Err(SiloError::Configuration(format!(
                "record id {} is reserved",
                record.id
            )));
        }
        if !(record.x.is_finite() && record.y.is_finite()) {
            return Err(SiloError::Configuration(format!(
                "record {} has a non-finite coordinate",
                record.id
            )));
        }
        if !ids.insert(record.id) {
            return Err(SiloError::Configuration(format!(
                "record id {} appears more than once",
                record.id
            )));
        }
    }
    Ok(())
}

/// A point well outside the indexed bounding box, so padding never satisfies
/// a genuine range predicate near the data.
fn dummy_coordinates(index: &GridIndex) -> (f32, f32) {
    let geometry = index.geometry();
    let coord = |dim: usize| {
        let span = geometry.max[dim] - geometry.min[dim];
        (geometry.min[dim] - (10.0 * span).max(1.0e6)) as f32
    };
    (coord(0), coord(1))
}
