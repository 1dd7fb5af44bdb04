//! Process lifecycle: run, stream, stdin, stop and replacement, driven by
//! real `/bin/sh` children.

mod common;

use std::time::{Duration, Instant};

use shared_types::{StandardEvent, TokenUsage};
use supervisor::config::SupervisorConfig;
use supervisor::observer::SupervisorNotice;
use supervisor::process::is_process_alive;

use common::*;

const INIT_THEN_RESULT: &str = r#"
printf '%s\n' '{"type":"init","session_id":"s1","model":"m"}'
printf '%s\n' '{"type":"result","tokens":{"input":10,"output":5}}'
"#;

#[tokio::test]
async fn test_end_to_end_run_reports_session_events_and_clean_exit() {
    let (sup, mut rx) = supervisor_with(sh_adapter(INIT_THEN_RESULT), fast_config());

    sup.run(request("a1", "hello")).await.expect("spawn failed");
    let notices = collect_until(&mut rx, Duration::from_secs(5), |n| is_complete(n, "a1")).await;

    let session_pos = notices
        .iter()
        .position(|n| {
            *n == SupervisorNotice::SessionId {
                agent_id: "a1".to_string(),
                session_id: "s1".to_string(),
            }
        })
        .expect("no session id notice");
    let is_init = |n: &SupervisorNotice| {
        matches!(
            n,
            SupervisorNotice::Event {
                event: StandardEvent::Init { .. },
                ..
            }
        )
    };
    let init_pos = notices.iter().position(is_init).expect("no init event");
    assert!(session_pos < init_pos, "session id must precede its event");

    let inits = notices.iter().filter(|n| is_init(n)).count();
    assert_eq!(inits, 1);

    let steps: Vec<&TokenUsage> = notices
        .iter()
        .filter_map(|n| match n {
            SupervisorNotice::Event {
                event: StandardEvent::StepComplete { tokens, .. },
                ..
            } => Some(tokens),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![&TokenUsage::new(10, 5)]);

    assert!(notices
        .iter()
        .any(|n| output_text(n) == Some("Session started: s1 (model: m)")));
    assert_eq!(
        notices.last(),
        Some(&SupervisorNotice::Complete {
            agent_id: "a1".to_string(),
            success: true
        })
    );

    // No restart follows a clean exit.
    let later = drain_for(&mut rx, Duration::from_millis(300)).await;
    assert!(later.is_empty(), "unexpected notices: {later:?}");
    assert!(!sup.is_running("a1"));
    assert!(sup.crash_history().is_empty());
}

#[tokio::test]
async fn test_non_json_output_is_passed_through() {
    let script = r#"
echo 'warning: not json'
printf '%s\n' '{"type":"text","text":"hi"}'
printf '%s' '{"type":"text","text":"no trailing newline"}'
"#;
    let (sup, mut rx) = supervisor_with(sh_adapter(script), fast_config());

    sup.run(request("a1", "hello")).await.expect("spawn failed");
    let notices = collect_until(&mut rx, Duration::from_secs(5), |n| is_complete(n, "a1")).await;
    let outputs: Vec<&str> = notices.iter().filter_map(output_text).collect();
    assert_eq!(outputs, vec!["warning: not json", "hi", "no trailing newline"]);
}

#[tokio::test]
async fn test_messages_are_delivered_over_stdin() {
    let script = r#"
while read -r line; do
  printf '{"type":"text","text":"echo:%s"}\n' "$line"
done
"#;
    let adapter = sh_adapter(script).with_stdin_prompt();
    let (sup, mut rx) = supervisor_with(adapter, fast_config());

    sup.run(request("a1", "hello")).await.expect("spawn failed");
    collect_until(&mut rx, Duration::from_secs(5), |n| output_text(n) == Some("echo:hello")).await;

    assert!(sup.send_message("a1", "again"));
    collect_until(&mut rx, Duration::from_secs(5), |n| output_text(n) == Some("echo:again")).await;

    assert!(!sup.send_message("nobody", "hi"));

    let stopping = sup.stop("a1").expect("agent was running");
    stopping.await.expect("escalation task panicked");
    assert!(!sup.is_running("a1"));
}

#[tokio::test]
async fn test_rerun_replaces_the_previous_process() {
    let (sup, mut rx) = supervisor_with(sh_adapter("sleep 30"), fast_config());

    sup.run(request("a1", "first")).await.expect("spawn failed");
    let first_pid = sup.registry().pid_of("a1").expect("first handle");

    sup.run(request("a1", "second")).await.expect("spawn failed");
    let second_pid = sup.registry().pid_of("a1").expect("second handle");

    assert_ne!(first_pid, second_pid);
    assert_eq!(sup.registry().len(), 1);

    // Replacing reports the old run as complete exactly once.
    let notices = drain_for(&mut rx, Duration::from_millis(500)).await;
    let completes = notices.iter().filter(|n| is_complete(n, "a1")).count();
    assert_eq!(completes, 1);
    assert!(!is_process_alive(first_pid));

    sup.stop_all().await;
    assert!(sup.registry().is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_leave_one_handle() {
    let (sup, _rx) = supervisor_with(sh_adapter("sleep 30"), fast_config());

    let (a, b) = tokio::join!(
        sup.run(request("a1", "one")),
        sup.run(request("a1", "two"))
    );
    a.expect("first run failed");
    b.expect("second run failed");
    assert_eq!(sup.registry().len(), 1);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_stop_escalates_to_kill_for_stubborn_process() {
    // Ignored signals stay ignored in the sleep children too.
    let script = r#"
trap '' INT TERM
printf '%s\n' '{"type":"init","session_id":"s9","model":"m"}'
while :; do sleep 0.1; done
"#;
    let (sup, mut rx) = supervisor_with(sh_adapter(script), SupervisorConfig::default());

    sup.run(request("a1", "hello")).await.expect("spawn failed");
    collect_until(&mut rx, Duration::from_secs(5), |n| {
        matches!(n, SupervisorNotice::SessionId { .. })
    })
    .await;
    let pid = sup.registry().pid_of("a1").expect("running");

    let started = Instant::now();
    let escalation = sup.stop("a1").expect("agent was running");
    assert!(started.elapsed() < Duration::from_millis(100), "stop must not block");
    assert!(!sup.is_running("a1"));

    escalation.await.expect("escalation task panicked");
    assert!(started.elapsed() >= Duration::from_millis(1500));

    let deadline = Instant::now() + Duration::from_secs(3);
    while is_process_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_process_alive(pid), "process survived SIGKILL");

    // Killed by the stop itself: not a crash.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sup.crash_history().is_empty());
}

#[tokio::test]
async fn test_interrupt_signals_once_and_keeps_the_agent() {
    let script = r#"
trap 'echo interrupted' INT
printf '%s\n' '{"type":"init","session_id":"s1","model":"m"}'
while :; do sleep 0.1; done
"#;
    let (sup, mut rx) = supervisor_with(sh_adapter(script), fast_config());

    sup.run(request("a1", "hello")).await.expect("spawn failed");
    collect_until(&mut rx, Duration::from_secs(5), |n| {
        matches!(n, SupervisorNotice::SessionId { .. })
    })
    .await;
    let pid = sup.registry().pid_of("a1").expect("running");

    assert!(sup.interrupt("a1"));
    let notices = drain_for(&mut rx, Duration::from_millis(500)).await;
    let hits = notices
        .iter()
        .filter(|n| output_text(n) == Some("interrupted"))
        .count();
    assert_eq!(hits, 1, "notices: {notices:?}");
    assert!(!notices.iter().any(|n| is_complete(n, "a1")));

    assert!(sup.is_running("a1"));
    assert_eq!(sup.registry().pid_of("a1"), Some(pid));
    assert!(is_process_alive(pid));

    sup.stop_all().await;
}

#[tokio::test]
async fn test_death_by_interrupt_is_intentional() {
    let script = r#"
printf '%s\n' '{"type":"init","session_id":"s1","model":"m"}'
exec sleep 30
"#;
    let (sup, mut rx) = supervisor_with(sh_adapter(script), fast_config());

    sup.run(request("a1", "hello")).await.expect("spawn failed");
    collect_until(&mut rx, Duration::from_secs(5), |n| {
        matches!(n, SupervisorNotice::SessionId { .. })
    })
    .await;

    assert!(sup.interrupt("a1"));
    let notices = collect_until(&mut rx, Duration::from_secs(5), |n| is_complete(n, "a1")).await;
    assert_eq!(
        notices.last(),
        Some(&SupervisorNotice::Complete {
            agent_id: "a1".to_string(),
            success: false
        })
    );

    let later = drain_for(&mut rx, Duration::from_millis(300)).await;
    assert!(later.is_empty(), "unexpected notices: {later:?}");
    assert!(!sup.is_running("a1"));
    assert!(!sup.has_pending_restart("a1"));
    assert!(sup.crash_history().is_empty());
}

#[tokio::test]
async fn test_interrupt_requires_a_running_agent() {
    let (sup, _rx) = supervisor_with(sh_adapter("sleep 30"), fast_config());
    assert!(!sup.interrupt("a1"));
    assert!(sup.stop("a1").is_none());
}

#[tokio::test]
async fn test_missing_executable_is_a_spawn_error() {
    let adapter = supervisor::adapters::generic::GenericJsonAdapter::new(
        "/nonexistent/agent-binary",
        Vec::new(),
    );
    let (sup, mut rx) = supervisor_with(adapter, fast_config());

    let err = sup.run(request("a1", "hello")).await.unwrap_err();
    assert!(matches!(err, supervisor::SupervisorError::Spawn { .. }));
    assert!(matches!(rx.try_recv(), Ok(SupervisorNotice::Error { .. })));
    assert!(!sup.is_running("a1"));
}
