// ABOUTME: Batch feature extraction: worker threads decode waveforms from their own read-only
// ABOUTME: handles and a single writer upserts the computed features into the features store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use aedb_core::{FeatureExtractor, FeatureRecord, TransientId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::handle::{OpenMode, Store, StoreKind, StoreLocation};
use crate::query::ReadFilter;
use crate::tradb::WaveformStore;
use crate::trfdb::FeatureStore;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Worker threads; 0 uses the available parallelism.
    pub workers: usize,
    /// Waveforms per decode batch and per write transaction.
    pub batch_size: usize,
    /// Which waveforms to process.
    pub filter: ReadFilter,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            batch_size: 256,
            filter: ReadFilter::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractSummary {
    /// Waveforms run through the extractor.
    pub processed: usize,
    /// Feature rows that did not exist before.
    pub inserted: usize,
}

fn worker_count(requested: usize, batches: usize) -> usize {
    let available = thread::available_parallelism().map_or(1, |n| n.get());
    let workers = if requested == 0 { available } else { requested };
    workers.clamp(1, batches.max(1))
}

/// Run `extractor` over the waveforms at `waveforms` and upsert the results
/// into `features`.
///
/// Each worker opens its own read-only handle from the location. The first
/// error stops the remaining workers and is returned; batches committed
/// before it stay committed.
pub fn extract_features<E: FeatureExtractor>(
    waveforms: &StoreLocation,
    features: &mut FeatureStore,
    extractor: &E,
    options: &ExtractOptions,
    config: &StoreConfig,
) -> Result<ExtractSummary, StoreError> {
    if waveforms.kind != StoreKind::Waveforms {
        return Err(StoreError::InvalidArgument(format!(
            "{} is not a waveforms store",
            waveforms.path.display()
        )));
    }
    let location = waveforms.with_mode(OpenMode::ReadOnly);
    let batch_size = options.batch_size.max(1);

    let trais = WaveformStore::open_location(&location, config)?.trais(&options.filter)?;
    let batches: Vec<Vec<TransientId>> = trais.chunks(batch_size).map(<[TransientId]>::to_vec).collect();
    let workers = worker_count(options.workers, batches.len());
    info!(
        path = %location.path.display(),
        waveforms = trais.len(),
        batches = batches.len(),
        workers,
        "extracting features"
    );

    let stop = AtomicBool::new(false);
    let (sender, receiver) = mpsc::sync_channel::<Result<Vec<FeatureRecord>, StoreError>>(workers * 2);
    let mut summary = ExtractSummary::default();
    let mut first_error = None;

    thread::scope(|scope| {
        for worker in 0..workers {
            let sender = sender.clone();
            let (location, batches, stop) = (&location, &batches, &stop);
            scope.spawn(move || {
                let store = match WaveformStore::open_location(location, config) {
                    Ok(store) => store,
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        return;
                    }
                };
                for batch in batches.iter().skip(worker).step_by(workers) {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let result = store.read(&ReadFilter::new().ids(batch.iter().copied()), false).map(|records| {
                        records
                            .iter()
                            .filter_map(|record| {
                                let trai = record.trai?;
                                Some(FeatureRecord {
                                    trai,
                                    features: extractor.extract(record),
                                })
                            })
                            .collect()
                    });
                    if sender.send(result).is_err() {
                        return;
                    }
                }
            });
        }
        drop(sender);

        for result in receiver {
            if first_error.is_some() {
                continue;
            }
            let written = result.and_then(|records| {
                let inserted = features.write_all(&records)?;
                Ok((records.len(), inserted))
            });
            match written {
                Ok((processed, inserted)) => {
                    summary.processed += processed;
                    summary.inserted += inserted;
                    debug!(processed = summary.processed, "feature batch stored");
                }
                Err(err) => {
                    warn!(error = %err, "feature extraction stopped");
                    stop.store(true, Ordering::SeqCst);
                    first_error = Some(err);
                }
            }
        }
    });

    if let Some(err) = first_error {
        return Err(err);
    }
    info!(processed = summary.processed, inserted = summary.inserted, "feature extraction done");
    Ok(summary)
}
