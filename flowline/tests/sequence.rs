//! End-to-end driver tests: config files on disk, sequential workflows,
//! drop-list merging, exit-path error reporting.

use flow_core::{Cache, CacheValue, Registry, Stage, StageContext, StageResult};
use flow_data::{AccessMode, DataManager, Store};
use flow_types::{Array, ElementType, ReserveSpec, RowSlice, ScalarType};
use flowline::{run, Config};
use std::path::Path;
use std::sync::Arc;

fn make_input(path: &Path, values: &[i64]) {
    let store = Store::new(path, AccessMode::ReadWriteCollective, vec![]);
    let dm = DataManager::new(Arc::clone(&store), Arc::new(flow_comm::SoloComm));
    dm.create_dset("raw/events", ElementType::scalar(ScalarType::I64))
        .unwrap();
    let slice = dm
        .reserve_data("raw/events", ReserveSpec::Count(values.len() as u64))
        .unwrap();
    dm.write_data("raw/events", slice, &Array::from_i64s(values))
        .unwrap();
    store.close().unwrap();
}

struct ShiftStage {
    output_dset: String,
    offset: i64,
}

impl Stage for ShiftStage {
    fn init(&mut self, ctx: &StageContext<'_>, source: &str) -> StageResult {
        let dm = ctx.data_manager;
        dm.create_dset(&self.output_dset, dm.dset_element(source)?)?;
        dm.create_ref(source, &self.output_dset)?;
        Ok(())
    }

    fn run(
        &mut self,
        ctx: &StageContext<'_>,
        source: &str,
        slice: RowSlice,
        cache: &mut Cache,
    ) -> StageResult {
        let dm = ctx.data_manager;
        let rows = cache
            .get(source)
            .and_then(CacheValue::as_rows)
            .ok_or("source rows missing")?;
        let shifted: Vec<i64> = rows.to_i64_vec()?.iter().map(|v| v + self.offset).collect();
        let out = dm.reserve_data(&self.output_dset, ReserveSpec::Count(shifted.len() as u64))?;
        dm.write_data(&self.output_dset, out, &Array::from_i64s(&shifted))?;
        let refs: Vec<[u64; 2]> = slice.range().zip(out.range()).map(|(s, o)| [s, o]).collect();
        dm.write_ref(source, &self.output_dset, &refs)?;
        Ok(())
    }
}

fn test_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_stage("ShiftStage", |build| {
        #[derive(serde::Deserialize)]
        struct Params {
            output_dset: String,
            offset: i64,
        }
        let params: Params = serde_yaml::from_value(build.params.clone())?;
        Ok(Box::new(ShiftStage {
            output_dset: params.output_dset,
            offset: params.offset,
        }))
    });
    registry
}

fn write_config(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn base_config(output: &Path, configs: Vec<std::path::PathBuf>, input: &Path) -> Config {
    Config {
        configs,
        input_filename: Some(input.to_path_buf()),
        output_filename: output.to_path_buf(),
        start_position: None,
        end_position: None,
        drop: vec![],
        workers: 1,
        nompi: false,
        verbose: false,
    }
}

#[test]
fn sequential_configs_chain_outputs() {
    let dir = test_helpers::tmp_dir().unwrap();
    let input = dir.path().join("in.bin");
    let output = dir.path().join("out.bin");
    make_input(&input, &(0..32).collect::<Vec<i64>>());

    let first = write_config(
        dir.path(),
        "first.yaml",
        r#"
flow:
  source: events
  stages: [shift]

events:
  classname: DatasetLoopGenerator
  dset_name: raw/events
  params:
    chunk_size: 8

shift:
  classname: ShiftStage
  params:
    output_dset: shifted
    offset: 100
"#,
    );
    let second = write_config(
        dir.path(),
        "second.yaml",
        r#"
flow:
  source: shifted
  stages: [shift2]

shift2:
  classname: ShiftStage
  params:
    output_dset: shifted_again
    offset: 1000
"#,
    );

    let config = base_config(&output, vec![first, second], &input);
    run::command_with_registry(config, &test_registry()).unwrap();

    let store = Store::new(&output, AccessMode::ReadWriteCollective, vec![]);
    let dm = DataManager::new(store, Arc::new(flow_comm::SoloComm));
    assert_eq!(dm.dset_len("shifted").unwrap(), 32);
    assert_eq!(dm.dset_len("shifted_again").unwrap(), 32);
    let got = dm
        .read_data("shifted_again", RowSlice::new(0, 32))
        .unwrap()
        .to_i64_vec()
        .unwrap();
    let expected: Vec<i64> = (0..32).map(|v| v + 1100).collect();
    assert_eq!(got, expected);
}

#[test]
fn cli_drop_merges_with_workflow_drop() {
    let dir = test_helpers::tmp_dir().unwrap();
    let input = dir.path().join("in.bin");
    let output = dir.path().join("out.bin");
    make_input(&input, &(0..16).collect::<Vec<i64>>());

    let wf = write_config(
        dir.path(),
        "wf.yaml",
        r#"
flow:
  source: events
  stages: [a, b]

events:
  classname: DatasetLoopGenerator
  dset_name: raw/events

a:
  classname: ShiftStage
  params:
    output_dset: kept_out
    offset: 1

b:
  classname: ShiftStage
  params:
    output_dset: dropped_out
    offset: 2
"#,
    );

    let mut config = base_config(&output, vec![wf], &input);
    config.drop = vec!["dropped_out".to_string()];
    run::command_with_registry(config, &test_registry()).unwrap();

    let store = Store::new(&output, AccessMode::ReadWriteCollective, vec![]);
    let dm = DataManager::new(store, Arc::new(flow_comm::SoloComm));
    assert!(dm.dset_exists("kept_out").unwrap());
    assert!(!dm.dset_exists("dropped_out").unwrap());
}

#[test]
fn multi_worker_driver_runs() {
    let dir = test_helpers::tmp_dir().unwrap();
    let input = dir.path().join("in.bin");
    let output = dir.path().join("out.bin");
    make_input(&input, &(0..64).collect::<Vec<i64>>());

    let wf = write_config(
        dir.path(),
        "wf.yaml",
        r#"
flow:
  source: events
  stages: [shift]

events:
  classname: DatasetLoopGenerator
  dset_name: raw/events
  params:
    chunk_size: 8

shift:
  classname: ShiftStage
  params:
    output_dset: shifted
    offset: 5
"#,
    );

    let mut config = base_config(&output, vec![wf], &input);
    config.workers = 4;
    run::command_with_registry(config, &test_registry()).unwrap();

    let store = Store::new(&output, AccessMode::ReadWriteCollective, vec![]);
    let dm = DataManager::new(store, Arc::new(flow_comm::SoloComm));
    assert_eq!(dm.dset_len("shifted").unwrap(), 64);
    // interleaved appends still cover exactly the shifted source values
    let mut got = dm
        .read_data("shifted", RowSlice::new(0, 64))
        .unwrap()
        .to_i64_vec()
        .unwrap();
    got.sort_unstable();
    let expected: Vec<i64> = (0..64).map(|v| v + 5).collect();
    assert_eq!(got, expected);
}

#[test]
fn missing_config_reports_load_error() {
    let dir = test_helpers::tmp_dir().unwrap();
    let config = base_config(
        &dir.path().join("out.bin"),
        vec![dir.path().join("nope.yaml")],
        &dir.path().join("in.bin"),
    );
    assert!(matches!(
        run::command_with_registry(config, &test_registry()),
        Err(run::Error::LoadConfig { .. })
    ));
}
