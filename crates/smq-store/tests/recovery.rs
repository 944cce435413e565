//! Kill-and-reopen recovery for the persistent store.

use std::{fs::OpenOptions, io::{Seek, SeekFrom, Write}};

use smq_store::{Location, PersistentStore, RecordType, layout};

const BUCKET_SIZE: u32 = 64 * 1024;

fn reopen(dir: &std::path::Path) -> std::sync::Arc<PersistentStore> {
    PersistentStore::open(dir, "broker", BUCKET_SIZE).unwrap()
}

/// Overwrites the record signature at `loc` with garbage, simulating a torn
/// write found after a crash.
fn clobber_signature(dir: &std::path::Path, loc: Location) {
    let path = dir.join("broker").join(format!("{:06}.bucket", loc.bucket));
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(u64::from(loc.offset))).unwrap();
    file.write_all(&[0xFF, 0xFF]).unwrap();
}

#[test]
fn list_contents_survive_a_kill() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = reopen(tmp.path());
        let list = store.list("/queue/late").unwrap();
        list.push_back(b"A").unwrap();
        list.push_back(b"B").unwrap();
        list.push_back(b"C").unwrap();
        // no flush, no orderly shutdown: the process just dies
    }

    let store = reopen(tmp.path());
    let list = store.list("/queue/late").unwrap();
    let data: Vec<Vec<u8>> = list.entries().unwrap().into_iter().map(|(_, d)| d).collect();
    assert_eq!(data, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
}

#[test]
fn free_index_covers_everything_but_live_records() {
    let tmp = tempfile::tempdir().unwrap();
    let live_payloads: Vec<usize> = {
        let store = reopen(tmp.path());
        let list = store.list("/queue/q").unwrap();
        list.push_back(&[1u8; 100]).unwrap();
        list.push_back(&[2u8; 50]).unwrap();
        let h = store.insert(RecordType::String, &[3u8; 64]).unwrap();
        store.insert(RecordType::String, &[4u8; 8]).unwrap();
        store.free(h).unwrap();
        // live: header(6+name), two items (12+data), one string record
        let name_len = "/queue/q".len();
        vec![6 + name_len, 12 + 100, 12 + 50, 8]
    };

    let store = reopen(tmp.path());
    let consumed: u64 = live_payloads
        .iter()
        .map(|&p| u64::from(layout::footprint(p as u32)))
        .sum();
    assert_eq!(store.available(), u64::from(BUCKET_SIZE) - consumed);
}

#[test]
fn a_broken_link_truncates_the_list() {
    let tmp = tempfile::tempdir().unwrap();
    let third = {
        let store = reopen(tmp.path());
        let list = store.list("/queue/q").unwrap();
        list.push_back(b"A").unwrap();
        list.push_back(b"B").unwrap();
        list.push_back(b"C").unwrap()
    };

    clobber_signature(tmp.path(), third);

    let store = reopen(tmp.path());
    let list = store.list("/queue/q").unwrap();
    let data: Vec<Vec<u8>> = list.entries().unwrap().into_iter().map(|(_, d)| d).collect();
    assert_eq!(data, vec![b"A".to_vec(), b"B".to_vec()]);

    // the truncated list keeps working
    list.push_back(b"D").unwrap();
    assert_eq!(list.len(), 3);
}

#[test]
fn a_corrupt_first_link_means_an_empty_list() {
    let tmp = tempfile::tempdir().unwrap();
    let first = {
        let store = reopen(tmp.path());
        let list = store.list("/queue/q").unwrap();
        list.push_back(b"only").unwrap()
    };

    clobber_signature(tmp.path(), first);

    let store = reopen(tmp.path());
    let list = store.list("/queue/q").unwrap();
    assert!(list.is_empty());
    assert_eq!(list.pop_front().unwrap(), None);
}

#[test]
fn recovered_records_are_a_subset_of_the_precrash_set() {
    let tmp = tempfile::tempdir().unwrap();
    let (live, freed) = {
        let store = reopen(tmp.path());
        let a = store.insert(RecordType::String, b"keep-a").unwrap();
        let b = store.insert(RecordType::String, b"drop-b").unwrap();
        let c = store.insert(RecordType::String, b"keep-c").unwrap();
        store.free(b).unwrap();
        (vec![a, c], b)
    };

    let store = reopen(tmp.path());
    for h in live {
        assert!(store.read(h).is_ok());
    }
    assert!(store.read(freed).is_err());
}
