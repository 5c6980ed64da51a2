use std::{
    collections::{BTreeSet, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use fedgeo_core::{QueryKind, QueryShape, Record, SiloId, SpatialQuery};
use fedgeo_crypto::PayloadCipher;
use fedgeo_dp::{random_seed, NoiseSampler};
use fedgeo_networking::{IndexMetadata, Metered, RpcError, SessionId, SiloClient};
use fedgeo_telemetry::{QueryLog, TelemetryHandle};
use rand::RngCore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    perturb::{candidate_buckets, QueryPerturber},
    CoordinatorError, ProtocolConfig, QueryMode, QueryStage, Result,
};

/// A verified answer record and the silo that held it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub silo: SiloId,
    pub record: Record,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryAnswer {
    pub kind: QueryKind,
    pub mode: QueryMode,
    /// Matching records sorted by silo then id. Empty for baseline counts.
    pub hits: Vec<Hit>,
    /// Number of matching records; the answer of a range count.
    pub count: u64,
    /// Records the silos released, dummies included.
    pub candidates: usize,
    pub dummies: usize,
    /// Genuine released records outside the true range.
    pub false_positives: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl QueryAnswer {
    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.hits.iter().map(|hit| hit.record.id).collect();
        ids.sort_unstable();
        ids
    }
}

/// Drives queries against a fixed set of silos. Each query gets its own
/// noise stream and session id; concurrent queries never share state.
pub struct Coordinator {
    clients: Vec<Arc<SiloClient>>,
    protocol: ProtocolConfig,
    perturber: QueryPerturber,
    master_seed: [u8; 32],
    query_seq: AtomicU64,
    telemetry: TelemetryHandle,
    query_log: QueryLog,
}

impl Coordinator {
    pub fn new(
        clients: Vec<SiloClient>,
        protocol: ProtocolConfig,
        seed: Option<[u8; 32]>,
        telemetry: TelemetryHandle,
    ) -> Result<Self> {
        protocol
            .validate()
            .map_err(CoordinatorError::Configuration)?;
        if clients.is_empty() {
            return Err(CoordinatorError::Configuration(
                "at least one silo must be configured".into(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = clients.iter().find(|c| !seen.insert(c.silo_id())) {
            return Err(CoordinatorError::Configuration(format!(
                "silo id {} configured twice",
                dup.silo_id()
            )));
        }
        let perturber = QueryPerturber::new(protocol.epsilon_spatial, &protocol.mechanism)?;
        info!(
            silos = clients.len(),
            mode = protocol.mode.as_str(),
            mechanism = protocol.mechanism.as_str(),
            epsilon_spatial = protocol.epsilon_spatial,
            encrypt_records = protocol.encrypt_records,
            "coordinator ready"
        );
        Ok(Self {
            clients: clients.into_iter().map(Arc::new).collect(),
            protocol,
            perturber,
            master_seed: seed.unwrap_or_else(random_seed),
            query_seq: AtomicU64::new(0),
            telemetry,
            query_log: QueryLog::new()?,
        })
    }

    pub fn silo_ids(&self) -> Vec<SiloId> {
        self.clients.iter().map(|client| client.silo_id()).collect()
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    pub fn query_log(&self) -> &QueryLog {
        &self.query_log
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    /// Answers `query` in the configured mode. Any silo failure aborts the
    /// whole query; no partial answer is returned.
    pub async fn run(&self, query: &SpatialQuery) -> Result<QueryAnswer> {
        if query.kind == QueryKind::DistanceJoin {
            return Err(CoordinatorError::UnsupportedQuery(query.kind));
        }
        let answer = match self.protocol.mode {
            QueryMode::Federated => self.run_federated(query).await?,
            QueryMode::Baseline => self.run_baseline(query).await?,
        };
        self.telemetry.record_counter("coordinator.queries", 1)?;
        Ok(answer)
    }

    async fn run_federated(&self, query: &SpatialQuery) -> Result<QueryAnswer> {
        // SETUP
        let timer = self.query_log.start();
        let seq = self.query_seq.fetch_add(1, Ordering::Relaxed);
        let mut sampler = self.query_sampler(seq);
        let session = SessionId(sampler.rng_mut().next_u64());
        let mut bytes = 0u64;
        debug!(seq, %session, kind = %query.kind, "query started");

        let stage_started = Instant::now();
        let metadata = self
            .fan_out(QueryStage::IndexFetch, move |_, client| async move {
                let metered = client
                    .publish_index_metadata()
                    .await
                    .map_err(|err| CoordinatorError::from_rpc(QueryStage::IndexFetch, err))?;
                check_metadata(client.silo_id(), &metered.value)?;
                Ok(metered)
            })
            .await?;
        bytes += metadata.iter().map(|m| m.bytes).sum::<u64>();
        self.stage_done(QueryStage::IndexFetch, stage_started);

        let stage_started = Instant::now();
        let range = self.perturber.perturb(&query.shape, &mut sampler)?;
        self.stage_done(QueryStage::QueryPerturb, stage_started);

        let stage_started = Instant::now();
        let per_silo: Vec<_> = metadata
            .iter()
            .map(|m| candidate_buckets(&m.value.geometry, &m.value.noisy_counts, &range))
            .collect();
        let acks = self
            .fan_out(QueryStage::CandidateBroadcast, move |slot, client| {
                let buckets = per_silo[slot].clone();
                async move {
                    client
                        .set_candidate_buckets(session, buckets)
                        .await
                        .map_err(|err| {
                            CoordinatorError::from_rpc(QueryStage::CandidateBroadcast, err)
                        })
                }
            })
            .await?;
        bytes += acks.iter().map(|ack| ack.bytes).sum::<u64>();
        self.stage_done(QueryStage::CandidateBroadcast, stage_started);

        let stage_started = Instant::now();
        let encrypted = self.protocol.encrypt_records;
        let released = self
            .fan_out(QueryStage::RecordFetch, move |_, client| async move {
                fetch_candidates(&client, session, encrypted).await
            })
            .await?;
        bytes += released.iter().map(|r| r.bytes).sum::<u64>();
        self.stage_done(QueryStage::RecordFetch, stage_started);

        let stage_started = Instant::now();
        let mut verified = Verified::default();
        for (client, batch) in self.clients.iter().zip(released) {
            verified.absorb(client.silo_id(), batch.value, &query.shape);
        }
        self.stage_done(QueryStage::Verify, stage_started);

        // DONE
        let elapsed = self.query_log.finish(timer, bytes);
        self.telemetry
            .record_counter("coordinator.candidates", verified.candidates as u64)?;
        self.telemetry
            .record_counter("coordinator.dummies", verified.dummies as u64)?;
        self.telemetry
            .record_counter("coordinator.false-positives", verified.false_positives as u64)?;
        let hits = verified.take_hits();
        info!(
            seq,
            %session,
            answer = hits.len(),
            bytes,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "federated query done"
        );
        Ok(QueryAnswer {
            kind: query.kind,
            mode: QueryMode::Federated,
            count: hits.len() as u64,
            hits,
            candidates: verified.candidates,
            dummies: verified.dummies,
            false_positives: verified.false_positives,
            bytes,
            elapsed,
        })
    }

    async fn run_baseline(&self, query: &SpatialQuery) -> Result<QueryAnswer> {
        let timer = self.query_log.start();
        let stage = QueryStage::RecordFetch;
        let request = *query;
        let (hits, count, bytes) = if query.kind == QueryKind::RangeCount {
            let counts = self
                .fan_out(stage, move |_, client| async move {
                    client
                        .answer_range_count(request)
                        .await
                        .map_err(|err| CoordinatorError::from_rpc(stage, err))
                })
                .await?;
            let total = counts.iter().map(|c| c.value).sum::<u64>();
            (Vec::new(), total, counts.iter().map(|c| c.bytes).sum())
        } else {
            let shape = query.shape;
            let answers = self
                .fan_out(stage, move |_, client| async move {
                    let answered = match shape {
                        QueryShape::Circle(circle) => {
                            client.answer_circle_range_query(circle).await
                        }
                        QueryShape::Rectangle(rect) => {
                            client.answer_rectangle_range_query(rect).await
                        }
                    };
                    answered.map_err(|err| CoordinatorError::from_rpc(stage, err))
                })
                .await?;
            let bytes = answers.iter().map(|a| a.bytes).sum();
            let mut hits: Vec<Hit> = self
                .clients
                .iter()
                .zip(answers)
                .flat_map(|(client, answer)| {
                    let silo = client.silo_id();
                    answer.value.into_iter().map(move |record| Hit { silo, record })
                })
                .collect();
            hits.sort_by_key(|hit| (hit.silo, hit.record.id));
            let count = hits.len() as u64;
            (hits, count, bytes)
        };
        let elapsed = self.query_log.finish(timer, bytes);
        info!(kind = %query.kind, count, bytes, "baseline query done");
        Ok(QueryAnswer {
            kind: query.kind,
            mode: QueryMode::Baseline,
            candidates: hits.len(),
            hits,
            count,
            dummies: 0,
            false_positives: 0,
            bytes,
            elapsed,
        })
    }

    fn query_sampler(&self, seq: u64) -> NoiseSampler {
        let mut label = Vec::with_capacity(48);
        label.extend_from_slice(b"fedgeo-query");
        label.extend_from_slice(&self.master_seed);
        label.extend_from_slice(&seq.to_le_bytes());
        NoiseSampler::derive(label)
    }

    fn stage_done(&self, stage: QueryStage, started: Instant) {
        let elapsed = started.elapsed();
        self.telemetry
            .record_latency_ms(stage.metric(), elapsed.as_millis() as u64);
        debug!(%stage, elapsed_us = elapsed.as_micros() as u64, "stage complete");
    }

    /// One task per silo, joined before returning. Results come back in
    /// silo order; the first failure aborts the remaining tasks.
    async fn fan_out<T, F, Fut>(&self, stage: QueryStage, mut call: F) -> Result<Vec<T>>
    where
        F: FnMut(usize, Arc<SiloClient>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (slot, client) in self.clients.iter().enumerate() {
            let pending = call(slot, Arc::clone(client));
            tasks.spawn(async move { (slot, pending.await) });
        }
        let mut slots: Vec<Option<T>> = self.clients.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, Ok(value))) => slots[slot] = Some(value),
                Ok((_, Err(err))) => {
                    tasks.abort_all();
                    warn!(%stage, error = %err, "query aborted");
                    return Err(err);
                }
                Err(join) => {
                    tasks.abort_all();
                    return Err(CoordinatorError::Task {
                        stage,
                        details: join.to_string(),
                    });
                }
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

fn check_metadata(silo: SiloId, metadata: &IndexMetadata) -> Result<()> {
    let detail = if metadata.silo_id != silo {
        format!("metadata names silo {}", metadata.silo_id)
    } else if !metadata.is_well_formed() {
        format!(
            "malformed index metadata (k={}, {} counts)",
            metadata.geometry.k,
            metadata.noisy_counts.len()
        )
    } else {
        return Ok(());
    };
    Err(CoordinatorError::ProtocolInvariant {
        stage: QueryStage::IndexFetch,
        silo,
        detail,
    })
}

async fn fetch_candidates(
    client: &SiloClient,
    session: SessionId,
    encrypted: bool,
) -> Result<Metered<Vec<Record>>> {
    let stage = QueryStage::RecordFetch;
    let rpc = |err: RpcError| CoordinatorError::from_rpc(stage, err);
    if !encrypted {
        return client.release_candidate_records(session).await.map_err(rpc);
    }
    let key = client.get_encryption_key().await.map_err(rpc)?;
    let sealed = client
        .release_encrypted_candidate_records(session)
        .await
        .map_err(rpc)?;
    let invariant = |detail: String| CoordinatorError::ProtocolInvariant {
        stage,
        silo: client.silo_id(),
        detail,
    };
    let cipher = PayloadCipher::new(&key.value).map_err(|err| invariant(err.to_string()))?;
    let aad = session.aad();
    let records = sealed
        .value
        .iter()
        .map(|record| cipher.open(record, &aad))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| invariant(err.to_string()))?;
    Ok(Metered {
        value: records,
        bytes: key.bytes + sealed.bytes,
    })
}

#[derive(Default)]
struct Verified {
    kept: BTreeSet<(SiloId, i32)>,
    hits: Vec<Hit>,
    candidates: usize,
    dummies: usize,
    false_positives: usize,
}

impl Verified {
    fn absorb(&mut self, silo: SiloId, batch: Vec<Record>, range: &QueryShape) {
        self.candidates += batch.len();
        for record in batch {
            if record.is_dummy() {
                self.dummies += 1;
            } else if !range.contains_record(&record) {
                self.false_positives += 1;
            } else if self.kept.insert((silo, record.id)) {
                self.hits.push(Hit { silo, record });
            }
        }
    }

    fn take_hits(&mut self) -> Vec<Hit> {
        let mut hits = std::mem::take(&mut self.hits);
        hits.sort_by_key(|hit| (hit.silo, hit.record.id));
        hits
    }
}
