//! End-to-end ingest tests: raw tagged lines in, correlated rows out.

use tsmon_core::config::PollerConfig;
use tsmon_core::poller::{IngestState, LineOutcome};
use tsmon_core::storage::{NewTeamServer, StorageHandle};

async fn open_storage() -> (tempfile::TempDir, StorageHandle, i64) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tsmon.db");
    let storage = StorageHandle::new(db.to_str().unwrap()).await.unwrap();
    let ts = storage
        .add_team_server(NewTeamServer {
            description: "integration ts".into(),
            hostname: "198.51.100.7".into(),
            port: 50050,
            password: "pw".into(),
        })
        .await
        .unwrap();
    (dir, storage, ts)
}

async fn feed(state: &mut IngestState, storage: &StorageHandle, lines: &[&str]) {
    let config = PollerConfig::default();
    for line in lines {
        let outcome = state.handle_line(storage, &config, line).await.unwrap();
        assert_eq!(outcome, LineOutcome::Continue, "unexpected desync on {line}");
    }
    state.flush_pending(storage).await.unwrap();
}

#[tokio::test]
async fn operator_session_produces_correlated_actions() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            "Loading Windows error codes...",
            "Connected OK. Synchronizing...",
            "Synchronized OK.",
            r#"[L] [1] {"name":"http-main","payload":"windows/beacon_http/reverse_http","host":"198.51.100.7","port":"80","localonly":"false"}"#,
            r#"[S] [2] {"id":"301","user":"jsmith","computer":"WKSTN01","process":"rundll32.exe","pid":"4242","is64":"1","session":"beacon","opened":"1000","listener":"http-main"}"#,
            // First command: input, acknowledgement task, fragmented output.
            r#"[B] [10] {"bid":"301","type":"beacon_input","data":"shell whoami","operator":"jsmith","when":"10000","task_id":"t-1"}"#,
            r#"[B] [11] {"bid":"301","type":"beacon_tasked","data":"Tasked beacon to run: whoami","when":"10050","task_id":"t-1"}"#,
            r#"[B] [12] {"bid":"301","type":"beacon_output","data":"CORP\\","when":"12000","task_id":"t-1"}"#,
            r#"[B] [13] {"bid":"301","type":"beacon_output","data":"jsmith\n","when":"12010","task_id":"t-1"}"#,
            // Second command while the first's output is still pending.
            r#"[B] [14] {"bid":"301","type":"beacon_input","data":"sleep 300 20","when":"13000","task_id":"t-2"}"#,
            r#"[B] [15] {"bid":"301","type":"beacon_tasked","data":"Tasked beacon to sleep for 300s (20% jitter)","when":"13050","task_id":"t-2"}"#,
        ],
    )
    .await;

    let beacon = storage.get_beacon_for_bid(ts, 301).await.unwrap().unwrap();
    assert_eq!(beacon.user.as_deref(), Some("jsmith"));

    // Exactly two actions: one per task id.
    let actions = storage.list_actions(beacon.id).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions[0].accept_output);

    let counts = storage.counts().await.unwrap();
    // input + task + merged output + input + task
    assert_eq!(counts.beacon_logs, 5);
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn output_fragments_merge_into_one_row() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[S] [1] {"id":"301","is64":"1","opened":"1000"}"#,
            r#"[B] [2] {"bid":"301","type":"beacon_input","data":"dir","when":"5000"}"#,
            r#"[B] [3] {"bid":"301","type":"beacon_output","data":"received output:\n Volume in drive C","when":"6000"}"#,
            r#"[B] [4] {"bid":"301","type":"beacon_output","data":" has no label.\n","when":"6010"}"#,
            r#"[B] [5] {"bid":"301","type":"beacon_output","data":" Directory of C:\\\n","when":"6020"}"#,
        ],
    )
    .await;

    let counts = storage.counts().await.unwrap();
    assert_eq!(counts.beacon_logs, 2);

    let beacon = storage.get_beacon_for_bid(ts, 301).await.unwrap().unwrap();
    let actions = storage.list_actions(beacon.id).await.unwrap();
    assert_eq!(actions.len(), 1);

    // Merged data has the tooling prefix stripped and a single trailing
    // newline.
    let merged = storage.log_data(2).await.unwrap().unwrap();
    assert_eq!(
        merged,
        " Volume in drive C has no label.\n Directory of C:\\\n"
    );
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn fragments_past_window_stay_separate() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[S] [1] {"id":"301","is64":"1","opened":"1000"}"#,
            r#"[B] [2] {"bid":"301","type":"beacon_output","data":"early","when":"6000"}"#,
            r#"[B] [3] {"bid":"301","type":"beacon_output","data":"late","when":"6100"}"#,
        ],
    )
    .await;

    assert_eq!(storage.counts().await.unwrap().beacon_logs, 2);
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn desync_marker_triggers_wipe_and_resync() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[L] [1] {"name":"http-main","payload":"windows/beacon_http"}"#,
            r#"[S] [2] {"id":"301","is64":"1","opened":"1000","listener":"http-main"}"#,
        ],
    )
    .await;
    assert_eq!(storage.counts().await.unwrap().beacons, 1);

    let config = PollerConfig::default();
    let outcome = state
        .handle_line(
            &storage,
            &config,
            "java.lang.RuntimeException: illegal subarray: 10 >= 4",
        )
        .await
        .unwrap();
    assert_eq!(outcome, LineOutcome::Desynchronized);

    // The poll loop wipes on that outcome; after the wipe the watermarks
    // reset so the next connect replays everything.
    storage.wipe_team_server_data(ts).await.unwrap();
    let marks = storage.sync_watermarks(ts).await.unwrap();
    assert_eq!(marks.last_session, 0);
    assert_eq!(marks.last_beacon_log, 0);
    assert_eq!(storage.counts().await.unwrap().team_servers, 1);

    // A fresh stream repopulates without conflict.
    let mut state = IngestState::new(ts, 15);
    feed(
        &mut state,
        &storage,
        &[
            r#"[L] [1] {"name":"http-main","payload":"windows/beacon_http"}"#,
            r#"[S] [2] {"id":"301","is64":"1","opened":"1000","listener":"http-main"}"#,
        ],
    )
    .await;
    assert_eq!(storage.counts().await.unwrap().beacons, 1);
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn checkin_metadata_builds_presence_windows() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[S] [1] {"id":"301","is64":"1","opened":"1000"}"#,
            // Fresh check-in with CS 4.7 sleep metadata.
            r#"[M] [301] {"last":"2000","sleep":"@(60L, 25L, 0L)"}"#,
        ],
    )
    .await;

    let beacon = storage.get_beacon_for_bid(ts, 301).await.unwrap().unwrap();
    assert!(beacon.last_seen_at.is_some());

    let windows = storage.list_presence(beacon.id).await.unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].sleep_seconds, 60);
    assert!((windows[0].sleep_jitter - 0.25).abs() < f64::EPSILON);
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_checkin_does_not_open_presence() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[S] [1] {"id":"301","is64":"1","opened":"1000"}"#,
            // Check-in reported 10 minutes ago: last-seen advances but
            // presence tracking is skipped.
            r#"[M] [301] {"last":"600000"}"#,
        ],
    )
    .await;

    let beacon = storage.get_beacon_for_bid(ts, 301).await.unwrap().unwrap();
    assert!(beacon.last_seen_at.is_some());
    assert!(storage.list_presence(beacon.id).await.unwrap().is_empty());
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn wrapped_and_plain_bids_resolve_to_one_beacon() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[S] [1] {"id":"301","is64":"1","opened":"1000"}"#,
            r#"[B] [2] {"bid":"301","type":"beacon_input","data":"pwd","when":"5000"}"#,
            r#"[B] [3] {"bid":"@('301')","type":"beacon_output","data":"C:\\Users\n","when":"5500"}"#,
        ],
    )
    .await;

    let beacon = storage.get_beacon_for_bid(ts, 301).await.unwrap().unwrap();
    let actions = storage.list_actions(beacon.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(storage.counts().await.unwrap().beacon_logs, 2);
    assert_eq!(storage.counts().await.unwrap().beacons, 1);
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn archives_attach_to_most_recent_action() {
    let (_dir, storage, ts) = open_storage().await;
    let mut state = IngestState::new(ts, 15);

    feed(
        &mut state,
        &storage,
        &[
            r#"[S] [1] {"id":"301","is64":"1","opened":"1000"}"#,
            r#"[B] [2] {"bid":"301","type":"beacon_input","data":"shell whoami","when":"5000"}"#,
            r#"[A] [3] {"bid":"301","type":"beacon_task","data":"Tasked beacon to run: whoami","tactic":"T1059","when":"5100L"}"#,
            // Archive without a beacon (webhit) saves but stays loose.
            r#"[A] [4] {"type":"webhit","data":"GET /updates","when":"5200"}"#,
        ],
    )
    .await;

    assert_eq!(storage.counts().await.unwrap().archives, 2);
    assert!(storage.action_for_archive(1).await.unwrap().is_some());
    assert!(storage.action_for_archive(2).await.unwrap().is_none());
    storage.shutdown().await.unwrap();
}
