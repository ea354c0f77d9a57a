
use std::sync::Arc;

use qless::job::Job;
use qless::store::Reply;
use qless::Client;

use test_harness::{job_json, now_secs, pop_reply, scripted_client, ScriptedStore};

/// Reserve one scripted job so every store round trip below goes through
/// a real handle.
async fn popped_job(store: &Arc<ScriptedStore>, client: &Client, jid: &str) -> Job {
    let payload = job_json(jid, "EchoJob", "default", now_secs() + 60.0);
    store.script("pop", pop_reply(&[payload]));
    client
        .queue("default")
        .pop()
        .await
        .unwrap()
        .expect("scripted job")
}

/// Test that complete sends jid, worker, queue, and the current payload,
/// and reports the resulting state.
#[tokio::test]
async fn test_complete_sends_worker_queue_and_payload() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-1").await;
    *job.payload_mut() = serde_json::json!({"x": 2});

    store.script("complete", Reply::Text("complete".to_string()));
    let state = job.complete().await.unwrap();

    assert_eq!(state, "complete");
    assert!(job.finalized());
    let call = &store.calls_for("complete")[0];
    assert_eq!(call.args, vec!["jid-1", "w1", "default", "{\"x\":2}"]);
}

/// Test that fail carries the failure group and message ahead of the
/// payload.
#[tokio::test]
async fn test_fail_sends_group_message_and_payload() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-2").await;

    job.fail("BoomError", "kaboom").await.unwrap();

    assert!(job.finalized());
    let call = &store.calls_for("fail")[0];
    assert_eq!(call.args, vec!["jid-2", "w1", "BoomError", "kaboom", "{}"]);
}

/// Test that cancel needs nothing but the jid.
#[tokio::test]
async fn test_cancel_sends_only_the_jid() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-3").await;

    job.cancel().await.unwrap();

    assert!(job.finalized());
    assert_eq!(store.calls_for("cancel")[0].args, vec!["jid-3"]);
}

/// Test that a bare retry sends jid, queue, worker, and delay.
#[tokio::test]
async fn test_retry_without_a_reason() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-4").await;

    store.script("retry", Reply::Int(4));
    let remaining = job.retry(30, None, None).await.unwrap();

    assert_eq!(remaining, 4);
    assert!(job.finalized());
    let call = &store.calls_for("retry")[0];
    assert_eq!(call.args, vec!["jid-4", "default", "w1", "30"]);
}

/// Test that a retry with a reason appends the group and message.
#[tokio::test]
async fn test_retry_with_a_reason() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-5").await;

    store.script("retry", Reply::Int(0));
    let remaining = job.retry(0, Some("Flaky"), Some("upstream 503")).await.unwrap();

    assert_eq!(remaining, 0);
    let call = &store.calls_for("retry")[0];
    assert_eq!(
        call.args,
        vec!["jid-5", "default", "w1", "0", "Flaky", "upstream 503"]
    );
}

/// Test that a second finalize on the same handle is caught locally.
#[tokio::test]
#[should_panic(expected = "second finalize")]
async fn test_double_finalize_is_a_caller_bug() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-6").await;

    store.script("complete", Reply::Text("complete".to_string()));
    job.complete().await.unwrap();
    let _ = job.complete().await;
}

/// Test that a rejected complete leaves the handle unfinalized, so the
/// caller can still fail the job.
#[tokio::test]
async fn test_rejected_complete_does_not_finalize() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-7").await;

    store.script_rejection("complete", "Job given out to another worker");
    let err = job.complete().await.unwrap_err();

    assert!(err.is_rejection());
    assert!(!job.finalized());

    job.fail("StoreRejection", "lost the lock").await.unwrap();
    assert!(job.finalized());
}

/// Test that heartbeat records the renewed expiry on the handle.
#[tokio::test]
async fn test_heartbeat_updates_the_local_expiry() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-8").await;

    let renewed = now_secs() + 120.0;
    store.script("heartbeat", Reply::Text(renewed.to_string()));
    let expires = job.heartbeat().await.unwrap();

    assert_eq!(expires, renewed);
    assert_eq!(job.expires_at(), renewed);
    assert!(job.ttl() > 100.0);
    assert_eq!(store.calls_for("heartbeat")[0].args, vec!["jid-8", "w1"]);
}

/// Test that timeout surrenders the lock without finalizing.
#[tokio::test]
async fn test_timeout_gives_the_lock_up() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-9").await;

    job.timeout().await.unwrap();

    assert!(!job.finalized());
    assert_eq!(store.calls_for("timeout")[0].args, vec!["jid-9"]);
}

/// Test the track toggle's subcommand-style arguments.
#[tokio::test]
async fn test_track_and_untrack() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-10").await;

    job.track().await.unwrap();
    assert!(job.data().tracked);
    job.untrack().await.unwrap();
    assert!(!job.data().tracked);

    let calls = store.calls_for("track");
    assert_eq!(calls[0].args, vec!["track", "jid-10"]);
    assert_eq!(calls[1].args, vec!["untrack", "jid-10"]);
}

/// Test that tagging mirrors the store's tag set locally.
#[tokio::test]
async fn test_tag_and_untag_mirror_locally() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-11").await;

    job.tag("nightly").await.unwrap();
    assert_eq!(job.data().tags, vec!["nightly"]);
    job.untag("nightly").await.unwrap();
    assert!(job.data().tags.is_empty());

    let calls = store.calls_for("tag");
    assert_eq!(calls[0].args, vec!["add", "jid-11", "nightly"]);
    assert_eq!(calls[1].args, vec!["remove", "jid-11", "nightly"]);
}

/// Test that a priority change is pushed remotely and mirrored locally.
#[tokio::test]
async fn test_set_priority() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-12").await;

    job.set_priority(10).await.unwrap();

    assert_eq!(job.data().priority, 10);
    assert_eq!(store.calls_for("priority")[0].args, vec!["jid-12", "10"]);
}

/// Test that moving a job re-puts it on the target queue with its
/// current payload and delay.
#[tokio::test]
async fn test_move_to_requeues_with_payload() {
    let (client, store) = scripted_client("w1");
    let mut job = popped_job(&store, &client, "jid-13").await;

    store.script("put", Reply::Text("jid-13".to_string()));
    let jid = job.move_to("other", 5).await.unwrap();

    assert_eq!(jid, "jid-13");
    let call = &store.calls_for("put")[0];
    assert_eq!(
        call.args,
        vec!["w1", "other", "jid-13", "EchoJob", "{}", "5"]
    );
}
