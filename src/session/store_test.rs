use std::sync::Arc;

use super::*;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("duet-store-{}", uuid::Uuid::new_v4()))
        .join(name)
}

#[test]
fn token_keys_use_persisted_names() {
    assert_eq!(TokenKey::Access.as_str(), "token");
    assert_eq!(TokenKey::Refresh.as_str(), "refreshToken");
}

#[test]
fn session_tokens_use_camel_case() {
    let tokens: SessionTokens =
        serde_json::from_str(r#"{"accessToken":"a","refreshToken":"r"}"#).expect("parse");
    assert_eq!(tokens.access_token, "a");
    assert_eq!(tokens.refresh_token.as_deref(), Some("r"));

    let only_access: SessionTokens = serde_json::from_str(r#"{"accessToken":"a"}"#).expect("parse");
    assert_eq!(only_access.refresh_token, None);
}

#[tokio::test]
async fn memory_store_set_get_clear() {
    let store = MemoryTokenStore::with_tokens(Some("T1"), None);
    assert_eq!(store.get(TokenKey::Access).await.expect("get").as_deref(), Some("T1"));
    assert_eq!(store.get(TokenKey::Refresh).await.expect("get"), None);

    store.set(TokenKey::Refresh, "R1").await.expect("set");
    assert_eq!(store.get(TokenKey::Refresh).await.expect("get").as_deref(), Some("R1"));

    store.clear().await.expect("clear");
    assert_eq!(store.get(TokenKey::Access).await.expect("get"), None);
    assert_eq!(store.get(TokenKey::Refresh).await.expect("get"), None);
}

#[tokio::test]
async fn file_store_missing_file_reads_empty() {
    let store = FileTokenStore::new(temp_path("tokens.json"));
    assert_eq!(store.get(TokenKey::Access).await.expect("get"), None);
}

#[tokio::test]
async fn file_store_persists_across_instances() {
    let path = temp_path("tokens.json");
    let store = FileTokenStore::new(&path);
    store.set(TokenKey::Access, "T1").await.expect("set");
    store.set(TokenKey::Refresh, "R1").await.expect("set");

    let reopened = FileTokenStore::new(&path);
    assert_eq!(reopened.get(TokenKey::Access).await.expect("get").as_deref(), Some("T1"));
    assert_eq!(reopened.get(TokenKey::Refresh).await.expect("get").as_deref(), Some("R1"));

    let raw = std::fs::read_to_string(&path).expect("read");
    assert!(raw.contains("\"refreshToken\""));
}

#[tokio::test]
async fn file_store_clear_keeps_foreign_keys() {
    let path = temp_path("tokens.json");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, r#"{"token":"T","refreshToken":"R","theme":"dark"}"#).expect("seed");

    let store = FileTokenStore::new(&path);
    store.clear().await.expect("clear");

    let raw = std::fs::read_to_string(&path).expect("read");
    assert!(raw.contains("theme"));
    assert!(!raw.contains("refreshToken"));
}

#[tokio::test]
async fn file_store_reports_corrupt_contents() {
    let path = temp_path("tokens.json");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, "not json").expect("seed");

    let store = FileTokenStore::new(&path);
    let err = store.get(TokenKey::Access).await.expect_err("should fail");
    assert!(matches!(err, StoreError::Corrupt(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_store_reads_never_see_a_partial_write() {
    let path = temp_path("tokens.json");
    let store = Arc::new(FileTokenStore::new(&path));
    store.set(TokenKey::Refresh, "R1").await.expect("seed");

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for round in 0..500 {
                store.set(TokenKey::Access, &format!("T{round}")).await.expect("set");
            }
        })
    };

    let mut reads = 0;
    while !writer.is_finished() {
        let refresh = store.get(TokenKey::Refresh).await.expect("get");
        assert_eq!(refresh.as_deref(), Some("R1"), "read {reads} lost the refresh token");
        reads += 1;
    }
    writer.await.expect("writer");

    let dir = path.parent().expect("parent");
    let leftovers = std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != "tokens.json")
        .count();
    assert_eq!(leftovers, 0, "no staging files left behind");
}
