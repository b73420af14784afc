use flate2::read::MultiGzDecoder;
use itertools::Itertools;
use pretty_duration::pretty_duration;
use snafu::prelude::*;
use std::{io::Read, time::Instant};

use crate::{
    caches::CacheSlot,
    config::UpdateConfig,
    decoding::ChangeDecoder,
    geometry::{GeometryAssembler, UnresolvedReference},
    osm_data::{Change, ChangeKind, Entity, Header},
    store::{EntityBatch, Store},
    Collaborators, Error, InvalidConfigSnafu, MissingHeaderSnafu, Result,
};

const MAX_SEQUENCE_NUMBER: i64 = 999_999_999;

/// The location of replication file `sequence_number` under `base`.
///
/// The number is zero-padded to nine digits and split into three directory levels,
/// so 1234567 with extension `osc.gz` becomes `{base}/001/234/567.osc.gz`.
pub fn resolve_uri(base: &str, sequence_number: i64, extension: &str) -> Result<String> {
    ensure!(
        (0..=MAX_SEQUENCE_NUMBER).contains(&sequence_number),
        InvalidConfigSnafu {
            description: format!("sequence number {sequence_number} has more than 9 digits or is negative"),
        }
    );
    let digits = format!("{sequence_number:09}");
    Ok(format!(
        "{}/{}/{}/{}.{}",
        base.trim_end_matches('/'),
        &digits[0..3],
        &digits[3..6],
        &digits[6..9],
        extension.trim_start_matches('.')
    ))
}

/// Where an [Updater] currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    ReadState,
    ResolveDiffUri,
    StreamingDiff,
    Applying,
    PersistState,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateReport {
    /// The header as committed at the end of the cycle.
    pub header: Header,
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub anomalies: Vec<UnresolvedReference>,
}

/// Applies one replication diff per cycle.
///
/// The header is only written after every change of the diff has been applied,
/// so a failed cycle leaves the store one sequence behind and can simply be rerun.
pub struct Updater<'a, S, D> {
    config: &'a UpdateConfig,
    decoder: &'a D,
    collaborators: Collaborators<'a, S>,
    cache: CacheSlot<'a>,
    state: UpdateState,
    created: usize,
    modified: usize,
    deleted: usize,
    anomalies: Vec<UnresolvedReference>,
}

impl<'a, S, D> Updater<'a, S, D>
where
    S: Store,
    D: ChangeDecoder,
{
    /// Fails if no cache is lent and the configured one can't be opened.
    pub fn new(
        config: &'a UpdateConfig,
        decoder: &'a D,
        mut collaborators: Collaborators<'a, S>,
    ) -> Result<Self> {
        let cache = CacheSlot::open(collaborators.cache.take(), config.cache)?;
        Ok(Updater {
            config,
            decoder,
            collaborators,
            cache,
            state: UpdateState::Idle,
            created: 0,
            modified: 0,
            deleted: 0,
            anomalies: Vec::new(),
        })
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    fn transition(&mut self, next: UpdateState) {
        log::debug!("Update: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: &Error) {
        log::error!("Update cycle failed: {error}");
        self.transition(UpdateState::Failed);
    }

    /// Read the header from the store and apply the diff that follows it.
    pub fn run_once(&mut self) -> Result<UpdateReport> {
        self.transition(UpdateState::ReadState);
        let header = match self
            .collaborators
            .store
            .read_header()
            .and_then(|header| header.context(MissingHeaderSnafu))
        {
            Ok(header) => header,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        let header = self.update(header)?;
        Ok(UpdateReport {
            header,
            created: self.created,
            modified: self.modified,
            deleted: self.deleted,
            anomalies: std::mem::take(&mut self.anomalies),
        })
    }

    /// Apply the diff following `header` and return the header that was committed.
    pub fn update(&mut self, header: Header) -> Result<Header> {
        // Counts and anomalies describe a single cycle.
        self.created = 0;
        self.modified = 0;
        self.deleted = 0;
        self.anomalies.clear();
        match self.cycle(header) {
            Ok(header) => {
                self.transition(UpdateState::Idle);
                Ok(header)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn cycle(&mut self, header: Header) -> Result<Header> {
        self.transition(UpdateState::ResolveDiffUri);
        let next = header.sequence_number + 1;
        let change_uri = resolve_uri(&header.replication_url, next, &self.config.change_extension)?;
        let state_uri = resolve_uri(&header.replication_url, next, &self.config.state_extension)?;

        self.transition(UpdateState::StreamingDiff);
        let start = Instant::now();
        log::info!("Applying diff {change_uri}...");
        let changes = self.decoder.decode_changes(self.open(&change_uri)?)?;
        for change in changes {
            let change = change?;
            self.transition(UpdateState::Applying);
            self.apply(change)?;
            self.transition(UpdateState::StreamingDiff);
        }

        self.transition(UpdateState::PersistState);
        let state = self.decoder.decode_state(self.open(&state_uri)?)?;
        if state.sequence_number != next {
            log::warn!(
                "State file {state_uri} is at sequence {}, expected {next}",
                state.sequence_number
            );
        }
        let header = Header {
            sequence_number: state.sequence_number,
            timestamp: state.timestamp,
            ..header
        };
        self.collaborators.store.write_header(header.clone())?;
        log::info!(
            "Caught up to sequence {} ({}) in {}",
            header.sequence_number,
            header.timestamp,
            pretty_duration(&start.elapsed(), None)
        );
        Ok(header)
    }

    /// Gzipped files are decompressed on the fly.
    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>> {
        let reader = self.collaborators.blobs.open(uri)?;
        if uri.ends_with(".gz") {
            Ok(Box::new(MultiGzDecoder::new(reader)))
        } else {
            Ok(reader)
        }
    }

    fn apply(&mut self, change: Change) -> Result<()> {
        log::debug!("Applying {} of {} entities", change.kind, change.entities.len());
        match change.kind {
            ChangeKind::Delete => {
                self.deleted += change.entities.len();
                let by_kind = change.entities.iter().group_by(|entity| entity.kind());
                for (kind, entities) in &by_kind {
                    let ids: Vec<i64> = entities.map(Entity::id).collect();
                    self.collaborators.store.delete(kind, &ids)?;
                }
            }
            ChangeKind::Create | ChangeKind::Modify => {
                if change.kind == ChangeKind::Create {
                    self.created += change.entities.len();
                } else {
                    self.modified += change.entities.len();
                }
                // Runs of the same kind go to the store together.
                let mut pending: Option<EntityBatch> = None;
                for entity in change.entities {
                    self.remember(&entity)?;
                    let entity = self.attach_geometry(entity)?;
                    pending = match pending {
                        None => Some(EntityBatch::of(entity)),
                        Some(mut batch) => match batch.push(entity) {
                            None => Some(batch),
                            Some(other) => {
                                self.collaborators.store.upsert(batch)?;
                                Some(EntityBatch::of(other))
                            }
                        },
                    };
                }
                if let Some(batch) = pending {
                    self.collaborators.store.upsert(batch)?;
                }
            }
        }
        Ok(())
    }

    /// Later entities of this and following diffs may refer to this one.
    fn remember(&mut self, entity: &Entity) -> Result<()> {
        match entity {
            Entity::Node(node) => self.cache.add_node(node),
            Entity::Way(way) => self.cache.add_way(way),
            Entity::Relation(_) => Ok(()),
        }
    }

    fn attach_geometry(&mut self, entity: Entity) -> Result<Entity> {
        let mut assembler = GeometryAssembler::new(
            &*self.cache,
            self.collaborators.reprojector,
            self.config.source_srid,
            self.config.target_srid,
        );
        let entity = assembler.attach(entity)?;
        self.anomalies.extend(assembler.into_anomalies());
        Ok(entity)
    }
}

/// Apply the next replication diff to the store.
pub fn run_update_once<S, D>(
    config: &UpdateConfig,
    decoder: &D,
    collaborators: Collaborators<'_, S>,
) -> Result<UpdateReport>
where
    S: Store,
    D: ChangeDecoder,
{
    Updater::new(config, decoder, collaborators)?.run_once()
}
