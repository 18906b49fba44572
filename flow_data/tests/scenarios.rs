//! End-to-end exercises of the data manager and reference algebra over a
//! real container file, single- and multi-worker.

use flow_comm::{run_workers, SoloComm};
use flow_data::{AccessMode, DataManager, DerefOptions, Ragged, Store};
use flow_types::{Array, ElementType, RegionEntry, ReserveSpec, RowSlice, ScalarType};
use std::sync::Arc;

fn i64_element() -> ElementType {
    ElementType::scalar(ScalarType::I64)
}

fn solo_manager(path: &std::path::Path) -> DataManager {
    let store = Store::new(path, AccessMode::ReadWriteCollective, vec![]);
    DataManager::new(store, Arc::new(SoloComm))
}

/// Create a dataset populated with the given values.
fn make_dset(dm: &DataManager, name: &str, values: &[i64]) {
    dm.create_dset(name, i64_element()).unwrap();
    let slice = dm
        .reserve_data(name, ReserveSpec::Count(values.len() as u64))
        .unwrap();
    dm.write_data(name, slice, &Array::from_i64s(values)).unwrap();
}

#[test]
fn single_worker_roundtrip() {
    test_helpers::maybe_start_logging();
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));

    let a: Vec<i64> = (0..10).collect();
    let b: Vec<i64> = (100..105).collect();
    make_dset(&dm, "A", &a);
    make_dset(&dm, "B", &b);
    dm.create_ref("A", "B").unwrap();
    dm.write_ref("A", "B", &[[0, 0], [0, 1], [2, 0], [3, 4], [9, 3]])
        .unwrap();

    let sel: Vec<u64> = (0..10).collect();
    let data = dm
        .dereference("A", "B", &sel, None, DerefOptions::default())
        .unwrap()
        .into_data()
        .unwrap();
    assert_eq!(data.shape, vec![10, 2]);

    let expect: Vec<Vec<i64>> = vec![
        vec![100, 101],
        vec![],
        vec![100],
        vec![104],
        vec![],
        vec![],
        vec![],
        vec![],
        vec![],
        vec![103],
    ];
    for (row, expected) in expect.iter().enumerate() {
        let got: Vec<i64> = (0..2).filter_map(|j| data.i64_at(row * 2 + j)).collect();
        assert_eq!(&got, expected, "row {}", row);
    }

    // the ragged form carries the same content without padding
    let ragged = dm
        .dereference_ragged("A", "B", &sel, None, DerefOptions::default())
        .unwrap();
    match ragged {
        Ragged::Data(lists) => {
            for (row, expected) in expect.iter().enumerate() {
                let got = lists[row].to_i64_vec().unwrap();
                assert_eq!(&got, expected, "ragged row {}", row);
            }
        }
        Ragged::Indices(_) => panic!("expected data"),
    }

    // ragged indices line up with the reference rows
    let ragged = dm
        .dereference_ragged("A", "B", &sel, None, DerefOptions { indices_only: true })
        .unwrap();
    match ragged {
        Ragged::Indices(lists) => {
            assert_eq!(lists[0], vec![0, 1]);
            assert_eq!(lists[3], vec![4]);
            assert!(lists[4].is_empty());
        }
        Ragged::Data(_) => panic!("expected indices"),
    }
}

#[test]
fn reverse_view_agrees_with_forward() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    make_dset(&dm, "A", &[0, 1, 2]);
    make_dset(&dm, "B", &[10, 11]);
    dm.create_ref("A", "B").unwrap();
    dm.write_ref("A", "B", &[[0, 1], [2, 0]]).unwrap();

    // forward and reverse views resolve through the same canonical table
    let forward = dm
        .dereference("A", "B", &[0, 1, 2], None, DerefOptions { indices_only: true })
        .unwrap()
        .into_indices()
        .unwrap();
    assert_eq!(forward.shape, vec![3, 1]);
    assert_eq!(forward.indices[0], 1);
    assert!(forward.mask[1]);
    assert_eq!(forward.indices[2], 0);

    let reverse = dm
        .dereference("B", "A", &[0, 1], None, DerefOptions { indices_only: true })
        .unwrap()
        .into_indices()
        .unwrap();
    assert_eq!(reverse.shape, vec![2, 1]);
    assert_eq!(reverse.indices[0], 2);
    assert_eq!(reverse.indices[1], 0);
}

#[test]
fn chained_dereference() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));

    make_dset(&dm, "A", &(0..10).collect::<Vec<_>>());
    make_dset(&dm, "B", &(50..55).collect::<Vec<_>>());
    make_dset(&dm, "C", &[1000, 1001, 1002]);
    dm.create_ref("A", "B").unwrap();
    dm.create_ref("B", "C").unwrap();
    dm.write_ref("A", "B", &[[0, 0], [1, 0], [1, 4]]).unwrap();
    dm.write_ref("B", "C", &[[0, 2], [4, 1]]).unwrap();

    let result = dm
        .dereference_chain(&["A", "B", "C"], &[0, 1], None, DerefOptions::default())
        .unwrap()
        .into_data()
        .unwrap();
    assert_eq!(result.shape, vec![2, 2, 1]);

    // A=0 -> [[C[2]], [masked]]
    assert_eq!(result.i64_at(0), Some(1002));
    assert_eq!(result.i64_at(1), None);
    // A=1 -> [[C[2]], [C[1]]]
    assert_eq!(result.i64_at(2), Some(1002));
    assert_eq!(result.i64_at(3), Some(1001));
}

#[test]
fn chained_dereference_masks_propagate_from_input() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    make_dset(&dm, "A", &[0, 1]);
    make_dset(&dm, "B", &[0]);
    dm.create_ref("A", "B").unwrap();
    dm.write_ref("A", "B", &[[0, 0], [1, 0]]).unwrap();

    let grid = dm
        .dereference_chain(
            &["A", "B"],
            &[0, 1],
            Some(&[true, false]),
            DerefOptions { indices_only: true },
        )
        .unwrap()
        .into_indices()
        .unwrap();
    assert_eq!(grid.shape, vec![2, 1]);
    assert!(grid.mask[0]);
    assert!(!grid.mask[1]);
}

#[test]
fn parallel_append_lays_out_rank_order() {
    test_helpers::maybe_start_logging();
    let dir = test_helpers::tmp_dir().unwrap();
    let path = dir.path().join("out.bin");
    let store = Store::new(&path, AccessMode::ReadWriteCollective, vec![]);

    let results = run_workers(4, |comm| -> flow_data::Result<()> {
        let dm = DataManager::new(Arc::clone(&store), comm);
        dm.create_dset("A", i64_element())?;
        dm.create_dset("B", i64_element())?;
        dm.create_ref("A", "B")?;
        dm.comm().barrier()?;

        let rank = dm.rank() as u64;
        let slice = dm.reserve_data("A", ReserveSpec::Count(7))?;
        assert_eq!(slice, RowSlice::new(7 * rank, 7 * rank + 7));
        let values: Vec<i64> = slice.range().map(|i| i as i64).collect();
        dm.write_data("A", slice, &Array::from_i64s(&values))?;

        let slice_b = dm.reserve_data("B", ReserveSpec::Count(7))?;
        dm.write_data("B", slice_b, &Array::from_i64s(&values))?;

        let rows: Vec<[u64; 2]> = slice.range().map(|i| [i, i]).collect();
        dm.write_ref("A", "B", &rows)?;
        Ok(())
    });
    for result in results {
        result.unwrap();
    }

    let dm = solo_manager(&path);
    assert_eq!(dm.dset_len("A").unwrap(), 28);
    assert_eq!(dm.dset_len("B").unwrap(), 28);

    let handle = dm.get_ref("A", "B").unwrap();
    assert_eq!(handle.rows, 28);
    assert_eq!(handle.direction, (0, 1));

    // identity references, so both region tables map row i to table row i
    for (parent, child) in [("A", "B"), ("B", "A")] {
        assert_eq!(dm.region_len(parent, child).unwrap(), 28);
        let entries = dm
            .read_region(parent, child, RowSlice::new(0, 28))
            .unwrap();
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(
                *entry,
                RegionEntry {
                    start: i as i64,
                    stop: i as i64 + 1,
                },
                "{} -> {} row {}",
                parent,
                child,
                i
            );
        }
    }

    let sel: Vec<u64> = (0..28).collect();
    let data = dm
        .dereference("A", "B", &sel, None, DerefOptions::default())
        .unwrap()
        .into_data()
        .unwrap();
    assert_eq!(data.shape, vec![28, 1]);
    for i in 0..28 {
        assert_eq!(data.i64_at(i), Some(i as i64));
    }
}

#[test]
fn overlapping_region_updates_widen_commutatively() {
    let dir = test_helpers::tmp_dir().unwrap();
    let path = dir.path().join("out.bin");
    let store = Store::new(&path, AccessMode::ReadWriteCollective, vec![]);

    // every worker references parent row 0; whichever order the updates
    // land in, the final window covers all four table rows
    let results = run_workers(4, |comm| -> flow_data::Result<()> {
        let dm = DataManager::new(Arc::clone(&store), comm);
        dm.create_dset("A", i64_element())?;
        dm.create_dset("B", i64_element())?;
        dm.create_ref("A", "B")?;
        dm.comm().barrier()?;
        let _ = dm.reserve_data("A", ReserveSpec::Count(1))?;
        let _ = dm.reserve_data("B", ReserveSpec::Count(1))?;
        dm.write_ref("A", "B", &[[0, dm.rank() as u64]])?;
        Ok(())
    });
    for result in results {
        result.unwrap();
    }

    let dm = solo_manager(&path);
    let entries = dm.read_region("A", "B", RowSlice::new(0, 1)).unwrap();
    assert_eq!(entries[0], RegionEntry { start: 0, stop: 4 });
}

#[test]
fn successive_batches_widen_regions() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    make_dset(&dm, "A", &(0..10).collect::<Vec<_>>());
    make_dset(&dm, "B", &(0..10).collect::<Vec<_>>());
    dm.create_ref("A", "B").unwrap();

    dm.write_ref("A", "B", &[[2, 1], [3, 0]]).unwrap();
    let first = dm.read_region("A", "B", RowSlice::new(0, 10)).unwrap();
    assert_eq!(first[2], RegionEntry { start: 0, stop: 1 });
    assert_eq!(first[3], RegionEntry { start: 1, stop: 2 });

    dm.write_ref("A", "B", &[[2, 5], [1, 1]]).unwrap();
    let second = dm.read_region("A", "B", RowSlice::new(0, 10)).unwrap();
    // start == min over both batches, stop == max over both batches
    assert_eq!(second[2], RegionEntry { start: 0, stop: 3 });
    assert_eq!(second[3], RegionEntry { start: 1, stop: 2 });
    assert_eq!(second[1], RegionEntry { start: 3, stop: 4 });

    // invariant: every table row mentioning parent i lies inside region[i]
    let handle = dm.get_ref("A", "B").unwrap();
    let sel: Vec<u64> = (0..10).collect();
    let grid = dm
        .dereference("A", "B", &sel, None, DerefOptions { indices_only: true })
        .unwrap()
        .into_indices()
        .unwrap();
    assert_eq!(grid.shape[0], 10);
    assert_eq!(handle.rows, 4);
}

#[test]
fn reserve_window_grows_to_furthest_stop() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    dm.create_dset("A", i64_element()).unwrap();

    let w = RowSlice::new(3, 8);
    let got = dm.reserve_data("A", ReserveSpec::Window(w)).unwrap();
    assert_eq!(got, w);
    assert_eq!(dm.dset_len("A").unwrap(), 8);

    // a window inside the current extent does not shrink anything
    let inner = RowSlice::new(0, 2);
    let got = dm.reserve_data("A", ReserveSpec::Window(inner)).unwrap();
    assert_eq!(got, inner);
    assert_eq!(dm.dset_len("A").unwrap(), 8);
}

#[test]
fn writes_outside_reservation_are_rejected() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    dm.create_dset("A", i64_element()).unwrap();
    let slice = dm.reserve_data("A", ReserveSpec::Count(4)).unwrap();

    // length mismatch
    assert!(matches!(
        dm.write_data("A", slice, &Array::from_i64s(&[1, 2])),
        Err(flow_data::Error::WriteLengthMismatch { .. })
    ));
    // outside the granted slice
    assert!(matches!(
        dm.write_data("A", RowSlice::new(2, 6), &Array::from_i64s(&[1, 2, 3, 4])),
        Err(flow_data::Error::WriteOutOfRange { .. })
    ));
    // a subrange is fine
    dm.write_data("A", RowSlice::new(1, 3), &Array::from_i64s(&[5, 6]))
        .unwrap();
}

#[test]
fn reference_conflict_on_opposite_order() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    make_dset(&dm, "A", &[0]);
    make_dset(&dm, "B", &[0]);
    dm.create_ref("A", "B").unwrap();
    // same order again: no-op
    dm.create_ref("A", "B").unwrap();
    // opposite order: rejected
    assert!(matches!(
        dm.create_ref("B", "A"),
        Err(flow_data::Error::ReferenceConflict { .. })
    ));
    // the reverse view resolves through the same canonical table
    let handle = dm.get_ref("B", "A").unwrap();
    assert_eq!(handle.direction, (1, 0));
}

#[test]
fn missing_lookups_report_kind() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    assert!(matches!(
        dm.dset_len("nope"),
        Err(flow_data::Error::DatasetMissing { .. })
    ));
    make_dset(&dm, "A", &[0]);
    make_dset(&dm, "B", &[0]);
    assert!(matches!(
        dm.get_ref("A", "B"),
        Err(flow_data::Error::ReferenceMissing { .. })
    ));
    assert!(matches!(
        dm.create_ref("A", "missing"),
        Err(flow_data::Error::DatasetMissing { .. })
    ));
}

#[test]
fn delete_removes_dataset_and_anchored_refs() {
    let dir = test_helpers::tmp_dir().unwrap();
    let path = dir.path().join("out.bin");
    let dm = solo_manager(&path);
    make_dset(&dm, "A", &[0, 1]);
    make_dset(&dm, "B", &[0, 1]);
    dm.create_ref("A", "B").unwrap();
    dm.write_ref("A", "B", &[[0, 0]]).unwrap();

    let refs = dm.get_refs("A").unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].dset0, "A");
    assert_eq!(refs[0].dset1, "B");

    dm.delete("A").unwrap();
    assert!(!dm.dset_exists("A").unwrap());
    assert!(!dm.ref_exists("A", "B").unwrap());
    // the peer dataset survives, its side of the reference group is gone
    assert!(dm.dset_exists("B").unwrap());
    assert!(!dm.exists("B/ref/A/ref_region").unwrap());
}

#[test]
fn transitive_growth_keeps_regions_sized() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    make_dset(&dm, "A", &[0, 1, 2]);
    make_dset(&dm, "B", &[0]);
    dm.create_ref("A", "B").unwrap();
    assert_eq!(dm.region_len("A", "B").unwrap(), 3);
    assert_eq!(dm.region_len("B", "A").unwrap(), 1);

    // growing A drags the A-side region table along
    let _ = dm.reserve_data("A", ReserveSpec::Count(5)).unwrap();
    assert_eq!(dm.dset_len("A").unwrap(), 8);
    assert_eq!(dm.region_len("A", "B").unwrap(), 8);
    assert_eq!(dm.region_len("B", "A").unwrap(), 1);
}

#[test]
fn attrs_roundtrip_through_manager() {
    let dir = test_helpers::tmp_dir().unwrap();
    let dm = solo_manager(&dir.path().join("out.bin"));
    dm.set_attrs(
        "stage0/out",
        [
            ("classname".to_string(), "Example".into()),
            ("class_version".to_string(), "0.1.0".into()),
            ("count".to_string(), 42i64.into()),
        ],
    )
    .unwrap();
    assert!(dm.attr_exists("stage0/out", "classname").unwrap());
    assert!(!dm.attr_exists("stage0/out", "missing").unwrap());
    assert_eq!(
        dm.get_attr("stage0/out", "count").unwrap().unwrap().as_i64(),
        Some(42)
    );
}

#[test]
fn dropped_paths_never_touch_primary() {
    let dir = test_helpers::tmp_dir().unwrap();
    let path = dir.path().join("out.bin");
    {
        let store = Store::new(
            &path,
            AccessMode::ReadWriteCollective,
            vec!["scratchonly".to_string()],
        );
        let scratch = store.scratch_path().unwrap().to_path_buf();
        let dm = DataManager::new(store, Arc::new(SoloComm));
        make_dset(&dm, "kept", &[1, 2, 3]);
        make_dset(&dm, "scratchonly/out", &[4, 5]);
        dm.create_ref("kept", "scratchonly/out").unwrap();
        dm.write_ref("kept", "scratchonly/out", &[[0, 0]]).unwrap();
        dm.finish().unwrap();
        assert!(!scratch.exists(), "scratch container must be removed");
    }

    let dm = solo_manager(&path);
    assert!(dm.dset_exists("kept").unwrap());
    assert!(!dm.dset_exists("scratchonly/out").unwrap());
    assert!(!dm.exists("kept/ref/scratchonly/out/ref").unwrap());
}
