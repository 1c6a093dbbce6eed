//! Entry lifecycle tests (spec §4.5) exercised through [`Cache`]: reference
//! counting surviving repeated `get`/`put`, and a killed entry becoming
//! unreachable by key while an outstanding reference keeps it alive.

mod support;

use mamont_cache::backend::{CreateArg, SetAttr};
use mamont_cache::error::CacheError;

#[tokio::test]
async fn repeated_get_put_leaves_the_cache_in_a_stable_state() {
    let (cache, backend) = support::test_cache();
    backend.seed_file(support::ROOT_ID, "f", b"data");

    let root = cache.get(support::root_key()).await.unwrap();
    for _ in 0..5 {
        let child = cache.lookup(&root, "f", &support::root_cred()).await.unwrap();
        cache.put(&child);
    }
    cache.put(&root);
    // No assertion beyond "doesn't panic/deadlock": repeated acquire/release
    // must not leak references or desynchronize the index.
}

#[tokio::test]
async fn cached_only_get_misses_without_touching_the_backend() {
    let (cache, _backend) = support::test_cache();
    let key = mamont_cache::key::Key::new(mamont_cache::key::BackendId(0), b"never-created");
    let err = cache.get_by_key(key, true).await.unwrap_err();
    assert_eq!(err, CacheError::NotFound);
}

#[tokio::test]
async fn unlink_of_an_open_file_still_lets_the_holder_finish_using_it() {
    let (cache, _backend) = support::test_cache();
    let root = cache.get(support::root_key()).await.unwrap();
    let file = cache
        .create_file(&root, "victim", CreateArg::Unchecked, SetAttr::default())
        .await
        .unwrap();
    cache.write(&file, 0, b"payload", false).await.unwrap();

    // Caller still holds `file`'s reference across the unlink.
    cache.unlink(&root, "victim").await.unwrap();

    let (bytes, _eof) = cache.read(&file, 0, 7).await.unwrap();
    assert_eq!(bytes, b"payload");

    cache.put(&file);
    cache.put(&root);
}
