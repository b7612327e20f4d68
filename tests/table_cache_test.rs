//! On-disk table cache round-trip.

use morseldb::query::plan::{self, Data};
use morseldb::storage::catalog::{DataSource, Table, TableColumn};
use morseldb::DataType;

fn sample_table(name: &str, rows: usize) -> (plan::ColumnarTable, Vec<Vec<Data>>) {
    let data: Vec<Vec<Data>> = (0..rows)
        .map(|i| {
            vec![
                if i % 7 == 0 { Data::Null } else { Data::Int32(i as i32) },
                Data::Str(format!("{name}-{i}")),
            ]
        })
        .collect();
    let table = plan::from_rows(&data, &[DataType::Int32, DataType::Varchar]);
    (table, data)
}

#[test]
fn test_serialize_deserialize_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tables.cache");

    let (first, first_rows) = sample_table("alpha", 2000);
    let (second, second_rows) = sample_table("beta", 10);

    let mut source = DataSource::default();
    for (name, table) in [("alpha", &first), ("beta", &second)] {
        source.relations.push(Table {
            num_rows: table.num_rows as u64,
            name: name.to_string(),
            columns: table
                .columns
                .iter()
                .map(|c| TableColumn { data_type: c.data_type, pages: c.page_ptrs() })
                .collect(),
        });
    }
    source.serialize(&path).unwrap();

    let loaded = DataSource::deserialize(&path).unwrap();
    assert!(loaded.is_mapped());
    assert_eq!(loaded.relations.len(), 2);
    assert_eq!(loaded.relations[0].name, "alpha");
    assert_eq!(loaded.relations[0].num_rows, 2000);
    assert_eq!(loaded.relations[1].name, "beta");

    // Reconstruct rows from the mapped pages and compare.
    for (relation, expected) in loaded.relations.iter().zip([&first_rows, &second_rows]) {
        let reread = plan::ColumnarTable {
            num_rows: relation.num_rows as usize,
            columns: relation
                .columns
                .iter()
                .map(|c| {
                    let mut column = plan::Column::new(c.data_type);
                    // Copy mapped pages so the drop path stays uniform.
                    for page in &c.pages {
                        let fresh = column.new_page();
                        unsafe {
                            (*fresh).bytes_mut().copy_from_slice(page.get().bytes());
                        }
                    }
                    column
                })
                .collect(),
        };
        assert_eq!(&plan::to_rows(&reread), expected);
    }
}

#[test]
fn test_corrupted_marker_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.cache");
    std::fs::write(&path, vec![0u8; 4 << 20]).unwrap();
    let err = DataSource::deserialize(&path).unwrap_err();
    assert!(err.to_string().contains("marker"));
}

#[test]
fn test_truncated_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.cache");
    std::fs::write(&path, b"s1gmod25").unwrap();
    assert!(DataSource::deserialize(&path).is_err());
}
