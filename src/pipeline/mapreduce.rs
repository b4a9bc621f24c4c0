//! A small in-process map-reduce engine.
//!
//! Each partition of an input dataset is one map task. Tasks run on the rayon
//! pool, each with its own `Mapper`, and route their output to reducers with a
//! hash partitioner. Map output is spilled to `bincode` files in a temporary
//! directory under the work directory, optionally after a combine step. Once
//! every map task of a stage has finished, each reducer reads its spills,
//! groups the records by key and writes one partition of the output dataset.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log::debug;
use rayon::prelude::*;
use rustc_hash::FxHasher;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::TempDir;

use crate::error::Result;
use crate::pipeline::dataset::{Dataset, DatasetWriter, read_records, write_records};
use crate::progress::task_progress;

/// Reducer a key is routed to.
pub fn partition<K: Hash>(key: &K, partitions: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Map output, bucketed by destination reducer.
pub struct Output<K, V> {
    buckets: Vec<Vec<(K, V)>>,
}

impl<K: Hash, V> Output<K, V> {
    pub fn new(partitions: usize) -> Self {
        Output {
            buckets: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    pub fn collect(&mut self, key: K, value: V) {
        let idx = partition(&key, self.buckets.len());
        self.buckets[idx].push((key, value));
    }

    fn into_records(self) -> Vec<(K, V)> {
        self.buckets.into_iter().flatten().collect()
    }
}

pub trait Mapper<K, V> {
    type OutKey;
    type OutValue;

    fn map(
        &mut self,
        key: K,
        value: V,
        out: &mut Output<Self::OutKey, Self::OutValue>,
    ) -> Result<()>;

    /// Called once after the last record of the task.
    fn finish(&mut self, _out: &mut Output<Self::OutKey, Self::OutValue>) -> Result<()> {
        Ok(())
    }
}

pub trait Reducer<K, V>: Sync {
    type OutKey: Serialize;
    type OutValue: Serialize;

    fn reduce(
        &self,
        key: K,
        values: Vec<V>,
        out: &mut Vec<(Self::OutKey, Self::OutValue)>,
    ) -> Result<()>;
}

/// Merges the values of a key within one map task.
pub trait Combiner<K, V>: Sync {
    fn combine(&self, key: &K, values: Vec<V>) -> Result<V>;
}

fn group_by_key<K: Ord, V>(records: impl IntoIterator<Item = (K, V)>) -> BTreeMap<K, Vec<V>> {
    let mut groups: BTreeMap<K, Vec<V>> = BTreeMap::new();
    for (key, value) in records {
        groups.entry(key).or_default().push(value);
    }

    groups
}

/// Intermediate data of one map-reduce stage.
pub struct Shuffle<K, V> {
    name: String,
    spill_dir: TempDir,
    num_reducers: usize,
    spills: Vec<Vec<PathBuf>>,
    next_task: usize,
    _records: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Shuffle<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Ord,
    V: Serialize + DeserializeOwned,
{
    pub fn new(name: &str, work_dir: &Path, num_reducers: usize) -> Result<Self> {
        let spill_dir = tempfile::Builder::new()
            .prefix("_shuffle")
            .tempdir_in(work_dir)?;
        let num_reducers = num_reducers.max(1);

        Ok(Shuffle {
            name: name.to_string(),
            spill_dir,
            num_reducers,
            spills: vec![Vec::new(); num_reducers],
            next_task: 0,
            _records: PhantomData,
        })
    }

    /// Run one map task per input partition. May be called once per input of
    /// a stage that reads several datasets.
    pub fn map<IK, IV, M, F>(
        &mut self,
        input: &Dataset<IK, IV>,
        make_mapper: F,
        combiner: Option<&dyn Combiner<K, V>>,
    ) -> Result<()>
    where
        IK: DeserializeOwned,
        IV: DeserializeOwned,
        M: Mapper<IK, IV, OutKey = K, OutValue = V>,
        F: Fn() -> M + Sync,
    {
        let num_tasks = input.num_partitions();
        let first_task = self.next_task;
        let spill_dir = self.spill_dir.path();
        let num_reducers = self.num_reducers;

        let progress_bar = task_progress(num_tasks as u64, &self.name, "map");

        let task_spills = (0..num_tasks)
            .into_par_iter()
            .map(|idx| -> Result<Vec<(usize, PathBuf)>> {
                let mut mapper = make_mapper();
                let mut out = Output::new(num_reducers);
                for (key, value) in input.read_partition(idx)? {
                    mapper.map(key, value, &mut out)?;
                }
                mapper.finish(&mut out)?;

                let spills = spill(spill_dir, first_task + idx, out, combiner)?;
                progress_bar.inc(1);
                Ok(spills)
            })
            .collect::<Result<Vec<_>>>()?;
        progress_bar.finish();

        for spills in task_spills {
            for (reducer, path) in spills {
                self.spills[reducer].push(path);
            }
        }
        self.next_task += num_tasks;

        Ok(())
    }

    /// Group the map output by key and reduce it into a new dataset.
    pub fn reduce<R>(self, reducer: &R, output: &Path) -> Result<Dataset<R::OutKey, R::OutValue>>
    where
        R: Reducer<K, V>,
    {
        let writer = DatasetWriter::create(output)?;

        let progress_bar = task_progress(self.num_reducers as u64, &self.name, "reduce");

        self.spills
            .par_iter()
            .enumerate()
            .try_for_each(|(idx, spills)| -> Result<()> {
                let mut records = Vec::new();
                for path in spills {
                    records.extend(read_records::<K, V>(path)?);
                }

                let mut reduced = Vec::new();
                for (key, values) in group_by_key(records) {
                    reducer.reduce(key, values, &mut reduced)?;
                }
                writer.write_partition(idx, &reduced)?;
                progress_bar.inc(1);

                Ok(())
            })?;
        progress_bar.finish();

        debug!(
            "{}: reduced {} map tasks into {} partitions",
            self.name, self.next_task, self.num_reducers
        );
        writer.commit()
    }
}

/// Write each non-empty bucket of a task's output to its own spill file.
fn spill<K, V>(
    spill_dir: &Path,
    task: usize,
    out: Output<K, V>,
    combiner: Option<&dyn Combiner<K, V>>,
) -> Result<Vec<(usize, PathBuf)>>
where
    K: Serialize + Ord,
    V: Serialize,
{
    let mut spills = Vec::new();
    for (reducer, bucket) in out.buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }

        let records = match combiner {
            Some(combiner) => group_by_key(bucket)
                .into_iter()
                .map(|(key, values)| {
                    let value = combiner.combine(&key, values)?;
                    Ok((key, value))
                })
                .collect::<Result<Vec<_>>>()?,
            None => bucket,
        };

        let path = spill_dir.join(format!("map-{task:05}-r-{reducer:05}.bin"));
        write_records(&path, &records)?;
        spills.push((reducer, path));
    }

    Ok(spills)
}

/// Run a stage without a reduce step; map task `i` writes output partition `i`.
pub fn map_only<IK, IV, M, F>(
    input: &Dataset<IK, IV>,
    make_mapper: F,
    output: &Path,
) -> Result<Dataset<M::OutKey, M::OutValue>>
where
    IK: DeserializeOwned,
    IV: DeserializeOwned,
    M: Mapper<IK, IV>,
    M::OutKey: Serialize + Hash,
    M::OutValue: Serialize,
    F: Fn() -> M + Sync,
{
    let writer = DatasetWriter::create(output)?;

    (0..input.num_partitions())
        .into_par_iter()
        .try_for_each(|idx| -> Result<()> {
            let mut mapper = make_mapper();
            let mut out = Output::new(1);
            for (key, value) in input.read_partition(idx)? {
                mapper.map(key, value, &mut out)?;
            }
            mapper.finish(&mut out)?;

            writer.write_partition(idx, &out.into_records())
        })?;

    writer.commit()
}
