use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBufferBuilder, Float64Array};
use arrow::buffer::{NullBuffer, ScalarBuffer};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::common::DatasetPath;
use crate::store::layout;

/// Fixed bounds and attributes of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Entities in the collection.
    pub entities: usize,
    /// Timesteps of the resolution axis.
    pub timesteps: usize,
    /// Bands of the property.
    pub bands: usize,
    /// Unit attribute.
    pub unit: String,
}

impl DatasetSpec {
    /// Values per band.
    pub fn cells(&self) -> usize {
        self.entities * self.timesteps
    }
}

/// In-memory (entities × timesteps × bands) array with a validity bit per
/// cell. Unwritten cells stay missing.
#[derive(Debug)]
pub struct DenseDataset {
    spec: DatasetSpec,
    values: Vec<Vec<f64>>,
    validity: Vec<BooleanBufferBuilder>,
}

impl DenseDataset {
    /// Allocate a dataset with every cell missing.
    pub fn new(spec: DatasetSpec) -> Self {
        let cells = spec.cells();
        let values = (0..spec.bands).map(|_| vec![0.0; cells]).collect();
        let validity = (0..spec.bands)
            .map(|_| {
                let mut bits = BooleanBufferBuilder::new(cells);
                bits.append_n(cells, false);
                bits
            })
            .collect();
        Self {
            spec,
            values,
            validity,
        }
    }

    /// Bounds and attributes.
    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    /// Store `run` at `[entity, 0..run.len(), band - 1]` and mark
    /// `[entity, run.len()..timesteps, band - 1]` missing.
    ///
    /// Returns `false`, writing nothing, when the coordinate or the run length
    /// falls outside the dataset bounds.
    pub fn write_run(&mut self, entity: usize, band: usize, run: &[f64]) -> bool {
        let t = self.spec.timesteps;
        if entity >= self.spec.entities || band == 0 || band > self.spec.bands || run.len() > t {
            return false;
        }
        let start = entity * t;
        let values = &mut self.values[band - 1];
        let bits = &mut self.validity[band - 1];

        values[start..start + run.len()].copy_from_slice(run);
        for i in 0..t {
            bits.set_bit(start + i, i < run.len());
        }
        values[start + run.len()..start + t].fill(0.0);
        true
    }

    /// Value at a cell, `None` when missing.
    pub fn get(&self, entity: usize, timestep: usize, band: usize) -> Option<f64> {
        let idx = entity * self.spec.timesteps + timestep;
        let bits = self.validity.get(band.checked_sub(1)?)?;
        (idx < bits.len() && bits.get_bit(idx)).then(|| self.values[band - 1][idx])
    }

    /// Convert to one record batch: column `band_<b>` per band, row
    /// `entity * timesteps + timestep`, nulls for missing cells.
    pub fn into_record_batch(self) -> Result<RecordBatch, ArrowError> {
        let metadata: HashMap<String, String> = [
            (layout::META_UNIT, self.spec.unit.clone()),
            (layout::META_ENTITIES, self.spec.entities.to_string()),
            (layout::META_TIMESTEPS, self.spec.timesteps.to_string()),
            (layout::META_BANDS, self.spec.bands.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let fields: Vec<Field> = (1..=self.spec.bands)
            .map(|b| Field::new(layout::band_column(b), DataType::Float64, true))
            .collect();
        let schema = Arc::new(Schema::new_with_metadata(fields, metadata));

        let columns: Vec<ArrayRef> = self
            .values
            .into_iter()
            .zip(self.validity)
            .map(|(values, mut bits)| {
                let nulls = NullBuffer::new(bits.finish());
                Arc::new(Float64Array::new(ScalarBuffer::from(values), Some(nulls))) as ArrayRef
            })
            .collect();

        RecordBatch::try_new(schema, columns)
    }
}

/// Shared map of datasets created on first write.
///
/// The map lock is the creation barrier: exactly one caller creates a given
/// path. Writes then lock only the dataset itself.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    datasets: Mutex<BTreeMap<DatasetPath, Arc<Mutex<DenseDataset>>>>,
}

impl DatasetRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dataset at `path`, created from `spec` if this is the first request.
    pub fn get_or_create(
        &self,
        path: &DatasetPath,
        spec: impl FnOnce() -> DatasetSpec,
    ) -> Arc<Mutex<DenseDataset>> {
        let mut datasets = self.datasets.lock();
        if let Some(existing) = datasets.get(path) {
            return Arc::clone(existing);
        }
        let created = Arc::new(Mutex::new(DenseDataset::new(spec())));
        datasets.insert(path.clone(), Arc::clone(&created));
        created
    }

    /// Number of datasets created so far.
    pub fn len(&self) -> usize {
        self.datasets.lock().len()
    }

    /// Whether no dataset has been created.
    pub fn is_empty(&self) -> bool {
        self.datasets.lock().is_empty()
    }

    /// Take ownership of every dataset, in path order.
    pub fn into_datasets(self) -> BTreeMap<DatasetPath, DenseDataset> {
        self.datasets
            .into_inner()
            .into_iter()
            .map(|(path, shared)| {
                let dataset = match Arc::try_unwrap(shared) {
                    Ok(owned) => owned.into_inner(),
                    Err(shared) => {
                        let mut guard = shared.lock();
                        let spec = guard.spec.clone();
                        let empty = DenseDataset::new(DatasetSpec { entities: 0, ..spec });
                        std::mem::replace(&mut *guard, empty)
                    }
                };
                (path, dataset)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Phase, Resolution};
    use arrow::array::Array;

    fn spec() -> DatasetSpec {
        DatasetSpec {
            entities: 2,
            timesteps: 4,
            bands: 2,
            unit: "MW".to_string(),
        }
    }

    #[test]
    fn write_run_pads_tail_with_missing() {
        let mut ds = DenseDataset::new(spec());
        assert!(ds.write_run(1, 2, &[1.5, -2.0]));

        assert_eq!(ds.get(1, 0, 2), Some(1.5));
        assert_eq!(ds.get(1, 1, 2), Some(-2.0));
        assert_eq!(ds.get(1, 2, 2), None);
        assert_eq!(ds.get(1, 3, 2), None);
        assert_eq!(ds.get(0, 0, 1), None);
    }

    #[test]
    fn shorter_rewrite_clears_previous_tail() {
        let mut ds = DenseDataset::new(spec());
        assert!(ds.write_run(0, 1, &[1.0, 2.0, 3.0, 4.0]));
        assert!(ds.write_run(0, 1, &[9.0]));
        assert_eq!(ds.get(0, 0, 1), Some(9.0));
        assert_eq!(ds.get(0, 3, 1), None);
    }

    #[test]
    fn rejects_out_of_bounds_writes() {
        let mut ds = DenseDataset::new(spec());
        assert!(!ds.write_run(2, 1, &[1.0]));
        assert!(!ds.write_run(0, 0, &[1.0]));
        assert!(!ds.write_run(0, 3, &[1.0]));
        assert!(!ds.write_run(0, 1, &[1.0; 5]));
    }

    #[test]
    fn record_batch_carries_nulls_and_metadata() -> Result<(), ArrowError> {
        let mut ds = DenseDataset::new(spec());
        ds.write_run(0, 1, &[1.0, 2.0, 3.0]);
        let batch = ds.into_record_batch()?;

        assert_eq!(batch.num_rows(), 8);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().metadata()[layout::META_UNIT], "MW");
        let band_1 = batch.column(0);
        assert_eq!(band_1.null_count(), 5);
        assert!(batch.column(1).is_null(0));
        Ok(())
    }

    #[test]
    fn registry_creates_each_path_once() {
        let registry = DatasetRegistry::new();
        let path = DatasetPath {
            phase: Phase::ShortTerm,
            resolution: Resolution::Interval,
            collection: "line".into(),
            property: "Flow".into(),
        };
        let mut created = 0;
        let first = registry.get_or_create(&path, || {
            created += 1;
            spec()
        });
        first.lock().write_run(0, 1, &[7.0]);
        let second = registry.get_or_create(&path, || unreachable!("already created"));
        assert_eq!(second.lock().get(0, 0, 1), Some(7.0));
        drop((first, second));
        assert_eq!(created, 1);

        let datasets = registry.into_datasets();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[&path].get(0, 0, 1), Some(7.0));
    }
}
