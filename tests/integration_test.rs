use des_store::{ContainerWriter, LocalReader, WriteOptions};
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn writes_and_reads_back_a_multi_file_container() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.des");

    {
        let mut w = ContainerWriter::open(&path, "ctr-1".into(), WriteOptions::default(), None).unwrap();
        w.add("hello.txt", b"hello, DES", &json!({"mime": "text/plain"})).await.unwrap();
        w.add("data.bin", &vec![0xABu8; 4096], &json!({"kind": "blob"})).await.unwrap();
        let stats = w.finalize().unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.data_length, 10 + 4096);
    }

    let reader = LocalReader::open(&path, None, None).await.unwrap();
    assert_eq!(reader.list(), vec!["hello.txt", "data.bin"]);
    assert!(reader.contains("hello.txt"));
    assert!(!reader.contains("nope.txt"));

    assert_eq!(&reader.get("hello.txt").await.unwrap()[..], b"hello, DES");
    let meta = reader.get_meta("hello.txt").await.unwrap();
    assert_eq!(meta["mime"], "text/plain");

    assert_eq!(reader.get("data.bin").await.unwrap().len(), 4096);

    let stats = reader.stats();
    assert_eq!(stats.file_count, 2);
}

#[tokio::test]
async fn aborted_container_leaves_no_file_behind() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("aborted.des");

    let mut w = ContainerWriter::open(&path, "ctr-2".into(), WriteOptions::default(), None).unwrap();
    w.add("partial.txt", b"not committed", &json!({})).await.unwrap();
    w.abort().unwrap();

    assert!(!path.exists());
}

#[tokio::test]
async fn truncated_container_is_refused_as_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("truncated.des");

    {
        let mut w = ContainerWriter::open(&path, "ctr-3".into(), WriteOptions::default(), None).unwrap();
        w.add("a.txt", b"some bytes", &json!({})).await.unwrap();
        w.finalize().unwrap();
    }

    // Chop the footer's trailing magic off — the reader must refuse this
    // rather than silently treating it as a smaller, valid container.
    let full = std::fs::read(&path).unwrap();
    std::fs::write(&path, &full[..full.len() - 4]).unwrap();

    let err = LocalReader::open(&path, None, None).await.unwrap_err();
    assert!(matches!(err, des_store::DesError::CorruptContainer(_)));
}

#[tokio::test]
async fn duplicate_name_is_rejected_before_any_bytes_are_flushed_twice() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dup.des");

    let mut w = ContainerWriter::open(&path, "ctr-4".into(), WriteOptions::default(), None).unwrap();
    w.add("same.txt", b"first", &json!({})).await.unwrap();
    let err = w.add("same.txt", b"second", &json!({})).await.unwrap_err();
    assert!(matches!(err, des_store::DesError::NameConflict(_)));
    w.abort().unwrap();
}
