use covstore::{
    from_bytes, from_reader, to_bytes, to_writer, CoverageCodec, CoverageMatrix, CoverageStore,
    DataRowCodec, Error, Result, RowCodec,
};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

/// Consolidated (stamp, matrix) per class, sorted by class name.
fn merged_view(store: &mut CoverageStore) -> BTreeMap<String, (i64, CoverageMatrix)> {
    let names: Vec<String> = store.lock().class_names().map(str::to_string).collect();
    names
        .into_iter()
        .map(|name| {
            let snap = store.get_coverage(&name).unwrap().unwrap();
            let entry = (snap.stamp(), snap.to_matrix());
            (name, entry)
        })
        .collect()
}

fn sample_store() -> CoverageStore {
    let mut store = CoverageStore::new();
    store.add_snapshot(
        "com/acme/Foo",
        CoverageMatrix::builder()
            .row([true, false, false])
            .absent_row()
            .missed_row(0)
            .build(),
        0x1234_5678_9ABC_DEF0,
    );
    store.add_snapshot(
        "com/acme/Foo",
        CoverageMatrix::builder()
            .row([false, false, true])
            .row([true])
            .absent_row()
            .build(),
        0x1234_5678_9ABC_DEF0,
    );
    store.add_snapshot(
        "com/acme/Bar$Inner",
        CoverageMatrix::builder().missed_row(5).build(),
        -42,
    );
    store.add_snapshot("com/acme/Empty", CoverageMatrix::default(), 0);
    store.add_snapshot(
        "com/acme/Unicode\u{00E9}\u{1F600}",
        CoverageMatrix::builder().row([true]).build(),
        i64::MAX,
    );
    store
}

#[test]
fn test_roundtrip_preserves_merged_view() {
    let mut original = sample_store();
    let bytes = to_bytes(&mut original).unwrap();
    let mut parsed = from_bytes(&bytes).unwrap();

    assert_eq!(parsed.len(), original.len());
    assert_eq!(merged_view(&mut parsed), merged_view(&mut original));

    let foo = parsed.get_coverage("com/acme/Foo").unwrap().unwrap();
    assert_eq!(foo.matrix().row(0), Some(&[true, false, true][..]));
    assert_eq!(foo.matrix().row(1), Some(&[true][..]));
    assert_eq!(foo.matrix().row(2), Some(&[][..]));
}

#[test]
fn test_decoded_store_has_one_snapshot_per_class() {
    let mut original = sample_store();
    let parsed = from_bytes(&to_bytes(&mut original).unwrap()).unwrap();
    let table = parsed.lock();
    for name in table.class_names() {
        assert_eq!(table.pending_len(name), 1, "{name} should be flattened");
    }
}

#[test]
fn test_multiple_serialization_rounds() {
    let mut current = sample_store();
    let expected = merged_view(&mut current);

    for round in 0..10 {
        let mut buffer = Vec::new();
        to_writer(&mut current, &mut buffer).unwrap();
        current = from_reader(Cursor::new(buffer)).unwrap();
        assert_eq!(merged_view(&mut current), expected, "Round {round}: view mismatch");
    }
}

#[test]
fn test_reencoding_decoded_store_is_stable() {
    let mut original = sample_store();
    let first = to_bytes(&mut original).unwrap();
    let mut parsed = from_bytes(&first).unwrap();
    let second = to_bytes(&mut parsed).unwrap();

    // Key order may differ between maps, but the byte count cannot.
    assert_eq!(first.len(), second.len());
    assert_eq!(merged_view(&mut from_bytes(&second).unwrap()), merged_view(&mut parsed));
}

#[test]
fn test_offline_union_of_two_runs() {
    let mut run1 = CoverageStore::new();
    run1.add_snapshot("Foo", CoverageMatrix::from(vec![vec![true, false]]), 7);
    run1.add_snapshot("Old", CoverageMatrix::from(vec![vec![true]]), 1);

    let mut run2 = CoverageStore::new();
    run2.add_snapshot("Foo", CoverageMatrix::from(vec![vec![false, true]]), 7);
    run2.add_snapshot("Old", CoverageMatrix::from(vec![vec![false, false]]), 2);

    let file1 = to_bytes(&mut run1).unwrap();
    let file2 = to_bytes(&mut run2).unwrap();

    let mut combined = from_bytes(&file1).unwrap();
    combined.merge(&from_bytes(&file2).unwrap());

    let foo = combined.get_coverage("Foo").unwrap().unwrap();
    assert_eq!(*foo.matrix(), CoverageMatrix::from(vec![vec![true, true]]));
    let old = combined.get_coverage("Old").unwrap().unwrap();
    assert_eq!(old.stamp(), 2);
    assert_eq!(*old.matrix(), CoverageMatrix::from(vec![vec![false, false]]));
}

#[test]
fn test_duplicate_class_keeps_later_record() {
    let mut data = Vec::new();
    data.extend_from_slice(&2i32.to_be_bytes());
    for stamp in [1i64, 2] {
        data.extend_from_slice(&[0, 1, b'A']);
        data.extend_from_slice(&stamp.to_be_bytes());
        data.extend_from_slice(&0i32.to_be_bytes());
    }

    let mut store = from_bytes(&data).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.get_coverage("A").unwrap().unwrap().stamp(), 2);
}

#[test]
fn test_empty_class_name_roundtrips() {
    let mut store = CoverageStore::new();
    store.add_snapshot("", CoverageMatrix::from(vec![vec![false, true]]), 9);

    let bytes = to_bytes(&mut store).unwrap();
    // count, then a zero-length name
    assert_eq!(&bytes[..6], &[0u8, 0, 0, 1, 0, 0][..]);

    let mut parsed = from_bytes(&bytes).unwrap();
    let snap = parsed.get_coverage("").unwrap().unwrap();
    assert_eq!(snap.stamp(), 9);
    assert_eq!(snap.matrix().row(0), Some(&[false, true][..]));
}

#[test]
fn test_failed_encode_writes_nothing() {
    let mut store = sample_store();
    store.add_snapshot("com/acme/Bad", CoverageMatrix::from(vec![vec![true]]), 1);
    store.add_snapshot("com/acme/Bad", CoverageMatrix::from(vec![vec![true], vec![]]), 1);

    let mut buffer = Vec::new();
    assert!(matches!(
        to_writer(&mut store, &mut buffer),
        Err(Error::StructuralMismatch { .. })
    ));
    assert!(buffer.is_empty());
}

#[test]
fn test_malformed_streams() {
    let mut valid = CoverageStore::new();
    valid.add_snapshot("A", CoverageMatrix::from(vec![vec![true]]), 1);
    let bytes = to_bytes(&mut valid).unwrap();

    // Declares two classes, holds one.
    let mut short = bytes.clone();
    short[..4].copy_from_slice(&2i32.to_be_bytes());
    assert!(matches!(from_bytes(&short), Err(Error::MalformedStream(_))));

    // Negative row count.
    let mut negative_rows = Vec::new();
    negative_rows.extend_from_slice(&1i32.to_be_bytes());
    negative_rows.extend_from_slice(&[0, 1, b'A']);
    negative_rows.extend_from_slice(&1i64.to_be_bytes());
    negative_rows.extend_from_slice(&(-3i32).to_be_bytes());
    assert!(matches!(
        from_bytes(&negative_rows),
        Err(Error::MalformedStream(_))
    ));

    // Huge declared counts fail on missing data, not on allocation.
    let mut huge = Vec::new();
    huge.extend_from_slice(&i32::MAX.to_be_bytes());
    assert!(matches!(from_bytes(&huge), Err(Error::MalformedStream(_))));
}

#[test]
fn test_io_errors_propagate() {
    struct FailingReader;
    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
        }
    }
    assert!(matches!(from_reader(FailingReader), Err(Error::Io(_))));

    struct FailingWriter;
    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    let mut store = sample_store();
    assert!(matches!(
        to_writer(&mut store, &mut FailingWriter),
        Err(Error::Io(_))
    ));
}

/// Packs eight probes per byte, with a leading marker byte.
#[derive(Debug, Default)]
struct PackedRows;

impl RowCodec for PackedRows {
    fn write_row<W: Write + ?Sized>(&self, writer: &mut W, row: Option<&[bool]>) -> Result<()> {
        let Some(row) = row else {
            writer.write_all(&[0])?;
            return Ok(());
        };
        writer.write_all(&[1, row.len() as u8])?;
        for chunk in row.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &hit)| acc | (u8::from(hit) << i));
            writer.write_all(&[byte])?;
        }
        Ok(())
    }

    fn read_row<R: Read + ?Sized>(&self, reader: &mut R) -> Result<Option<Vec<bool>>> {
        let mut marker = [0u8; 1];
        reader.read_exact(&mut marker)?;
        if marker[0] == 0 {
            return Ok(None);
        }
        let mut len = [0u8; 1];
        reader.read_exact(&mut len)?;
        let len = usize::from(len[0]);
        let mut packed = vec![0u8; len.div_ceil(8)];
        reader.read_exact(&mut packed)?;
        Ok(Some(
            (0..len).map(|i| packed[i / 8] & (1 << (i % 8)) != 0).collect(),
        ))
    }
}

#[test]
fn test_custom_row_codec() {
    let codec = CoverageCodec::new(PackedRows);
    let mut store = sample_store();

    let mut buffer = Vec::new();
    codec.encode(store.table_mut(), &mut buffer).unwrap();
    let table = codec.decode(&mut Cursor::new(&buffer)).unwrap();
    let mut parsed = CoverageStore::from_table(table);
    assert_eq!(merged_view(&mut parsed), merged_view(&mut store));

    let default_codec: CoverageCodec = CoverageCodec::new(DataRowCodec);
    let mut default_buffer = Vec::new();
    default_codec
        .encode(store.table_mut(), &mut default_buffer)
        .unwrap();
    assert_ne!(buffer.len(), default_buffer.len());
}
