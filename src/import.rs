use itertools::Itertools;
use pretty_duration::pretty_duration;
use std::{sync::Arc, time::Instant};

use crate::{
    caches::{CacheSlot, ReferenceCache},
    config::ImportConfig,
    decoding::SnapshotFormat,
    geometry::{GeometryAssembler, UnresolvedReference},
    osm_data::{Block, DataBlock, Header},
    store::{EntityBatch, Store},
    utils::{Delivery, ParallelMapper},
    Collaborators, Result,
};

/// Where an [Importer] currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    /// Waiting for the next batch of blocks from the decoders.
    Decoding,
    BatchReady,
    /// Caching, assembling and persisting one batch.
    Applying,
    Done,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImportReport {
    pub blocks: usize,
    pub batches: usize,
    pub nodes: usize,
    pub ways: usize,
    pub relations: usize,
    pub anomalies: Vec<UnresolvedReference>,
}

/// Bulk loads a snapshot.
///
/// Blocks are decoded in parallel but applied strictly in file order, one batch
/// of `batch_size` blocks at a time: all of a batch is cached before any of it is
/// assembled, and the store gets at most one call per entity kind and batch.
pub struct Importer<'a, S, F> {
    config: &'a ImportConfig,
    format: Arc<F>,
    collaborators: Collaborators<'a, S>,
    cache: CacheSlot<'a>,
    state: ImportState,
    report: ImportReport,
}

impl<'a, S, F> Importer<'a, S, F>
where
    S: Store,
    F: SnapshotFormat,
{
    /// Fails if no cache is lent and the configured one can't be opened.
    pub fn new(
        config: &'a ImportConfig,
        format: Arc<F>,
        mut collaborators: Collaborators<'a, S>,
    ) -> Result<Self> {
        let cache = CacheSlot::open(collaborators.cache.take(), config.cache)?;
        Ok(Importer {
            config,
            format,
            collaborators,
            cache,
            state: ImportState::Idle,
            report: ImportReport::default(),
        })
    }

    pub fn state(&self) -> ImportState {
        self.state
    }

    /// What has been imported so far.
    pub fn report(&self) -> &ImportReport {
        &self.report
    }

    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    fn transition(&mut self, next: ImportState) {
        log::debug!("Import: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn run(&mut self, snapshot_uri: &str) -> Result<ImportReport> {
        match self.import(snapshot_uri) {
            Ok(()) => {
                self.transition(ImportState::Done);
                Ok(self.report.clone())
            }
            Err(e) => {
                log::error!("Import of {snapshot_uri} failed: {e}");
                self.transition(ImportState::Failed);
                Err(e)
            }
        }
    }

    fn import(&mut self, snapshot_uri: &str) -> Result<()> {
        self.config.validate()?;
        let start = Instant::now();
        let size = self.collaborators.blobs.size(snapshot_uri)?;
        log::info!("Importing {snapshot_uri} ({}MB)...", size / 1_000_000);

        self.transition(ImportState::Decoding);
        let units = self.format.units(self.collaborators.blobs.open(snapshot_uri)?)?;
        let mapper = ParallelMapper::new(self.config.concurrency)?;
        let format = Arc::clone(&self.format);
        let blocks = mapper.map(units, Delivery::SourceOrder, move |unit: Result<F::Unit>| {
            format.decode(unit?)
        });
        let batches = blocks.chunks(self.config.batch_size);
        for batch in &batches {
            let batch: Vec<Block> = batch.collect::<Result<_>>()?;
            self.transition(ImportState::BatchReady);
            self.apply(batch)?;
            self.transition(ImportState::Decoding);
        }

        log::info!(
            "Finished importing {} blocks in {} ({} nodes, {} ways, {} relations, {} unresolved references). The cache holds ~{}MB on the heap.",
            self.report.blocks,
            pretty_duration(&start.elapsed(), None),
            self.report.nodes,
            self.report.ways,
            self.report.relations,
            self.report.anomalies.len(),
            self.cache.heap_size() / 1_000_000
        );
        Ok(())
    }

    fn apply(&mut self, blocks: Vec<Block>) -> Result<()> {
        self.transition(ImportState::Applying);
        self.report.blocks += blocks.len();
        let (headers, data): (Vec<Header>, Vec<DataBlock>) =
            blocks.into_iter().partition_map(|block| match block {
                Block::Header(header) => itertools::Either::Left(header),
                Block::Data(data) => itertools::Either::Right(data),
            });

        for block in &data {
            self.cache.populate(block)?;
        }

        let mut assembler = GeometryAssembler::new(
            &*self.cache,
            self.collaborators.reprojector,
            self.config.source_srid,
            self.config.target_srid,
        );
        let mut nodes = Vec::new();
        let mut ways = Vec::new();
        let mut relations = Vec::new();
        for block in data {
            for mut node in block.dense_nodes.into_iter().chain(block.nodes) {
                let geometry = assembler.node_geometry(&node);
                node.geometry = assembler.reproject(geometry)?;
                nodes.push(node);
            }
            for mut way in block.ways {
                let geometry = assembler.way_geometry(&way);
                way.geometry = assembler.reproject(geometry)?;
                ways.push(way);
            }
            for mut relation in block.relations {
                let geometry = assembler.relation_geometry(&relation);
                relation.geometry = assembler.reproject(geometry)?;
                relations.push(relation);
            }
        }
        self.report.anomalies.extend(assembler.into_anomalies());

        for header in headers {
            let header = self.complete_header(header);
            log::debug!("Writing header at sequence {}", header.sequence_number);
            self.collaborators.store.write_header(header)?;
        }
        log::debug!(
            "Persisting batch {}: {} nodes, {} ways, {} relations",
            self.report.batches,
            nodes.len(),
            ways.len(),
            relations.len()
        );
        self.report.nodes += nodes.len();
        self.report.ways += ways.len();
        self.report.relations += relations.len();
        for batch in [
            EntityBatch::Nodes(nodes),
            EntityBatch::Ways(ways),
            EntityBatch::Relations(relations),
        ] {
            if !batch.is_empty() {
                self.collaborators.store.upsert(batch)?;
            }
        }
        self.report.batches += 1;
        Ok(())
    }

    fn complete_header(&self, mut header: Header) -> Header {
        if let Some(url) = &self.config.replication_url {
            header.replication_url = url.clone();
        }
        if let Some(sequence_number) = self.config.sequence_number {
            header.sequence_number = sequence_number;
        }
        header
    }
}

/// Import the snapshot at `snapshot_uri` into the store.
pub fn run_import<S, F>(
    snapshot_uri: &str,
    config: &ImportConfig,
    format: Arc<F>,
    collaborators: Collaborators<'_, S>,
) -> Result<ImportReport>
where
    S: Store,
    F: SnapshotFormat,
{
    Importer::new(config, format, collaborators)?.run(snapshot_uri)
}
