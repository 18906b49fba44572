//! The source iterator contract and the default dataset loop generator.

use crate::stage::{StageContext, StageResult};
use flow_types::RowSlice;
use observability_deps::tracing::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Class name of the built-in loop generator; configurations without a
/// source section fall back to it.
pub const DATASET_LOOP_GENERATOR: &str = "DatasetLoopGenerator";

/// Everything a generator factory gets to construct an instance.
#[derive(Debug)]
pub struct GeneratorBuild<'a> {
    /// Instance name (the configuration key).
    pub name: &'a str,
    /// Registered class name.
    pub classname: &'a str,
    /// Source dataset the generator loops over or produces.
    pub dset_name: &'a str,
    /// Input container to stage into the output, when configured.
    pub input_filename: Option<&'a Path>,
    /// First source row to process.
    pub start_position: Option<u64>,
    /// One past the last source row to process.
    pub end_position: Option<u64>,
    /// Untyped parameter bag.
    pub params: &'a serde_yaml::Value,
}

/// Produces the per-worker source slices that drive the run loop.
///
/// `next` returning `None` means "locally exhausted"; the controller keeps
/// such workers participating with the EMPTY slice until every worker is
/// exhausted in the same step, so all collectives stay aligned.
pub trait Generator: Send {
    /// The source dataset stages are sliced against.
    fn dset_name(&self) -> &str;

    /// Stage input data into the output container, before anything opens
    /// the store. Called once, first in the init phase.
    fn stage_input(&mut self, _ctx: &StageContext<'_>) -> StageResult {
        Ok(())
    }

    /// Called once before the run loop, after resources are initialized.
    fn init(&mut self, _ctx: &StageContext<'_>) -> StageResult {
        Ok(())
    }

    /// The next slice for this worker, or `None` when exhausted.
    fn next(&mut self, ctx: &StageContext<'_>) -> StageResult<Option<RowSlice>>;

    /// Called once after the run loop.
    fn finish(&mut self, _ctx: &StageContext<'_>) -> StageResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkSize {
    /// Align to the dataset's chunk-layout hint.
    Auto,
    /// Fixed number of rows per slice.
    Rows(u64),
}

#[derive(Debug, Deserialize)]
struct LoopParams {
    #[serde(default)]
    chunk_size: Option<serde_yaml::Value>,
}

/// The default source iterator: copies the input container to the output
/// path (worker 0, once), then partitions the `[start, end)` window of the
/// source dataset into fixed-size slices distributed round-robin by rank
/// with stride `size * chunk`.
#[derive(Debug)]
pub struct LoopGenerator {
    dset_name: String,
    chunk_size: ChunkSize,
    input_filename: PathBuf,
    start_position: Option<u64>,
    end_position: Option<u64>,
    slices: Vec<RowSlice>,
    iteration: usize,
}

impl LoopGenerator {
    /// Construct from a configuration section.
    pub fn from_build(build: &GeneratorBuild<'_>) -> StageResult<Self> {
        let input_filename = build
            .input_filename
            .ok_or("an input filename is required to loop over a dataset")?
            .to_path_buf();
        let chunk_size = match build.params {
            serde_yaml::Value::Null => ChunkSize::Auto,
            params => {
                let params: LoopParams = serde_yaml::from_value(params.clone())?;
                match params.chunk_size {
                    None => ChunkSize::Auto,
                    Some(serde_yaml::Value::String(s)) if s == "auto" => ChunkSize::Auto,
                    Some(serde_yaml::Value::Number(n)) => {
                        let rows = n
                            .as_u64()
                            .filter(|rows| *rows > 0)
                            .ok_or("chunk_size must be a positive integer or 'auto'")?;
                        ChunkSize::Rows(rows)
                    }
                    Some(other) => {
                        return Err(
                            format!("chunk_size must be a positive integer or 'auto', got {:?}", other)
                                .into(),
                        )
                    }
                }
            }
        };
        Ok(Self {
            dset_name: build.dset_name.to_string(),
            chunk_size,
            input_filename,
            start_position: build.start_position,
            end_position: build.end_position,
            slices: Vec::new(),
            iteration: 0,
        })
    }
}

impl Generator for LoopGenerator {
    fn dset_name(&self) -> &str {
        &self.dset_name
    }

    fn stage_input(&mut self, ctx: &StageContext<'_>) -> StageResult {
        let output = ctx.data_manager.store().path().to_path_buf();
        if self.input_filename != output {
            if ctx.rank() == 0 {
                info!(
                    input = %self.input_filename.display(),
                    output = %output.display(),
                    "copying input container to output",
                );
                std::fs::copy(&self.input_filename, &output)?;
            }
            ctx.data_manager.comm().barrier()?;
        }
        Ok(())
    }

    fn init(&mut self, ctx: &StageContext<'_>) -> StageResult {
        let dm = ctx.data_manager;
        let rows = dm.dset_len(&self.dset_name)?;
        let start = self.start_position.unwrap_or(0);
        let end = self.end_position.map(|e| e.min(rows)).unwrap_or(rows);
        let chunk = match self.chunk_size {
            ChunkSize::Auto => dm.dset_chunk_rows(&self.dset_name)?,
            ChunkSize::Rows(rows) => rows,
        };

        let mut position = start + ctx.rank() as u64 * chunk;
        let stride = ctx.size() as u64 * chunk;
        while position < end {
            self.slices
                .push(RowSlice::new(position, (position + chunk).min(end)));
            position += stride;
        }
        debug!(
            dset = self.dset_name.as_str(),
            rank = ctx.rank(),
            chunk,
            slices = self.slices.len(),
            "loop slices prepared",
        );
        Ok(())
    }

    fn next(&mut self, _ctx: &StageContext<'_>) -> StageResult<Option<RowSlice>> {
        let slice = self.slices.get(self.iteration).copied();
        self.iteration += 1;
        Ok(slice)
    }
}
