mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{
    ScriptedTransport, TEST_DOWNLOAD_DIR, drain, next_event, orchestrator, progress_of,
    test_settings, wait_for_state,
};
use media_downloader::common::models::DownloadRequest;
use media_downloader::downloader::progress::{ProgressSample, RawProgress};
use media_downloader::downloader::{
    DownloadEvent, DownloadOrchestrator, TaskState, TransportEvent,
};

const MAGNET: &str = "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056&dn=ubuntu";
const VIDEO_A: &str = "https://www.youtube.com/watch?v=aaaaaaaaaaa";
const VIDEO_B: &str = "https://www.youtube.com/watch?v=bbbbbbbbbbb";

fn transports() -> (Arc<ScriptedTransport>, Arc<ScriptedTransport>) {
    (
        Arc::new(ScriptedTransport::swarm()),
        Arc::new(ScriptedTransport::extraction()),
    )
}

#[tokio::test]
async fn test_start_creates_queued_task_before_transport_events() {
    let swarm = Arc::new(ScriptedTransport::swarm());
    let extraction =
        Arc::new(ScriptedTransport::extraction().with_begin_delay(Duration::from_millis(300)));
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let a = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    let b = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    assert_ne!(a, b);

    let tasks = orch.list();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, a);
    assert_eq!(tasks[1].id, b);
    assert!(tasks.iter().all(|t| t.state == TaskState::Queued));
    assert_eq!(tasks[0].save_path, PathBuf::from(TEST_DOWNLOAD_DIR));
    assert_eq!(tasks[0].progress_percent, 0.0);
    assert_eq!(tasks[0].rate_label, "Unknown");

    // 第一个事件就是 queued 快照
    match next_event(&mut sub).await {
        DownloadEvent::Progress { task } => {
            assert_eq!(task.id, a);
            assert_eq!(task.state, TaskState::Queued);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    wait_for_state(&mut sub, &a, TaskState::Downloading).await;
}

#[tokio::test]
async fn test_empty_source_is_invalid_request() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    for request in [
        DownloadRequest::swarm(""),
        DownloadRequest::extraction("   "),
        DownloadRequest {
            source_descriptor: None,
            ..DownloadRequest::swarm(MAGNET)
        },
    ] {
        let err = orch.start(request).unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    assert!(orch.list().is_empty());
    assert!(drain(&mut sub).await.is_empty());
    assert!(swarm.calls().is_empty());
}

#[tokio::test]
async fn test_progress_is_monotonic_and_held_below_completion() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;

    for ratio in [0.1, 0.5, 0.3, f64::NAN, 1.0] {
        assert!(swarm.progress(&id, ratio).await);
    }
    swarm
        .emit(
            &id,
            TransportEvent::Progress(ProgressSample {
                progress: RawProgress::Unknown,
                rate: None,
                eta: None,
            }),
        )
        .await;

    let mut percents = Vec::new();
    while percents.len() < 6 {
        if let DownloadEvent::Progress { task } = next_event(&mut sub).await {
            assert_eq!(task.state, TaskState::Downloading);
            percents.push(task.progress_percent);
        }
    }
    assert_eq!(percents, vec![10.0, 50.0, 50.0, 50.0, 99.9, 99.9]);
    assert_ne!(orch.get(&id).unwrap().progress_percent, 100.0);
}

#[tokio::test]
async fn test_round_trip_completes_exactly_once() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch
        .start(DownloadRequest::extraction(VIDEO_A).with_name("clip"))
        .unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;

    for percent in [0.0, 25.0, 50.0, 75.0, 100.0] {
        extraction
            .emit(
                &id,
                TransportEvent::Progress(ProgressSample::percent(percent)),
            )
            .await;
    }
    extraction.emit(&id, TransportEvent::Completed).await;
    // 完成之后的事件被丢弃
    extraction.emit(&id, TransportEvent::Completed).await;
    extraction.progress(&id, 0.2).await;

    let done = wait_for_state(&mut sub, &id, TaskState::Completed).await;
    assert_eq!(done.progress_percent, 100.0);
    assert_eq!(done.display_name, "clip");

    let rest = drain(&mut sub).await;
    assert!(progress_of(&rest, &id).is_empty(), "late events: {:?}", rest);

    let task = orch.get(&id).unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.progress_percent, 100.0);
    assert!(task.error_detail.is_none());
}

#[tokio::test]
async fn test_cancel_drops_late_events_and_emits_canceled_once() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    extraction.progress(&id, 0.2).await;
    drain(&mut sub).await;

    assert!(orch.cancel(&id).await.is_done());
    assert!(orch.list().iter().all(|t| t.id != id));
    assert!(orch.get(&id).is_none());

    // 迟到的事件
    extraction.progress(&id, 0.6).await;
    extraction.emit(&id, TransportEvent::Completed).await;

    let second = orch.cancel(&id).await;
    assert_eq!(second.warning().map(|e| e.code()), Some("UnknownTask"));

    let events = drain(&mut sub).await;
    assert_eq!(
        events,
        vec![DownloadEvent::Canceled {
            task_id: id.clone()
        }]
    );
    assert_eq!(extraction.call_count(&format!("cancel:{}", id)), 1);
    assert!(orch.get(&id).is_none());
}

#[tokio::test]
async fn test_cancel_while_queued_never_begins_transfer() {
    let swarm = Arc::new(ScriptedTransport::swarm().with_begin_delay(Duration::from_millis(200)));
    let extraction = Arc::new(ScriptedTransport::extraction());
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    assert!(orch.cancel(&id).await.is_done());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let events = drain(&mut sub).await;
    let canceled = events
        .iter()
        .filter(|e| matches!(e, DownloadEvent::Canceled { .. }))
        .count();
    assert_eq!(canceled, 1);
    assert!(
        progress_of(&events, &id)
            .iter()
            .all(|t| t.state == TaskState::Queued)
    );
    assert!(orch.list().is_empty());
    assert!(!swarm.has_begun(&id));
}

#[tokio::test]
async fn test_cancel_after_error_removes_record() {
    let swarm = Arc::new(ScriptedTransport::swarm());
    let extraction = Arc::new(ScriptedTransport::extraction().failing_begin("yt-dlp 不存在"));
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Error).await;
    drain(&mut sub).await;

    assert!(orch.cancel(&id).await.is_done());
    assert_eq!(
        drain(&mut sub).await,
        vec![DownloadEvent::Canceled {
            task_id: id.clone()
        }]
    );
    assert!(orch.list().is_empty());
    assert_eq!(extraction.call_count(&format!("cancel:{}", id)), 0);
}

#[tokio::test]
async fn test_swarm_pause_resume_are_unsupported() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;

    let ack = orch.pause(&id).await;
    assert_eq!(ack.warning().map(|e| e.code()), Some("CapabilityUnsupported"));
    assert_eq!(orch.get(&id).unwrap().state, TaskState::Downloading);

    let ack = orch.resume(&id).await;
    assert_eq!(ack.warning().map(|e| e.code()), Some("CapabilityUnsupported"));
    assert_eq!(orch.get(&id).unwrap().state, TaskState::Downloading);

    assert!(drain(&mut sub).await.is_empty());
    assert!(swarm.calls().iter().all(|c| !c.starts_with("pause")));
}

#[tokio::test]
async fn test_extraction_pause_and_resume() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    extraction.progress(&id, 0.3).await;

    // 还没暂停时恢复
    let ack = orch.resume(&id).await;
    assert_eq!(ack.warning().map(|e| e.code()), Some("InvalidState"));

    assert!(orch.pause(&id).await.is_done());
    let paused = wait_for_state(&mut sub, &id, TaskState::Paused).await;
    assert_eq!(paused.progress_percent, 30.0);
    assert_eq!(paused.rate_label, "Unknown");

    // 暂停期间进程残留的输出不改变记录
    extraction.progress(&id, 0.4).await;
    assert!(progress_of(&drain(&mut sub).await, &id).is_empty());
    assert_eq!(orch.get(&id).unwrap().progress_percent, 30.0);

    let ack = orch.pause(&id).await;
    assert_eq!(ack.warning().map(|e| e.code()), Some("InvalidState"));

    assert!(orch.resume(&id).await.is_done());
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    extraction.progress(&id, 0.5).await;
    match next_event(&mut sub).await {
        DownloadEvent::Progress { task } => assert_eq!(task.progress_percent, 50.0),
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(
        extraction.calls(),
        vec![
            format!("begin:{}", id),
            format!("pause:{}", id),
            format!("resume:{}", id)
        ]
    );
}

#[tokio::test]
async fn test_two_extractions_are_independent() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let a = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    let b = orch.start(DownloadRequest::extraction(VIDEO_B)).unwrap();
    assert_ne!(a, b);
    wait_for_state(&mut sub, &a, TaskState::Downloading).await;
    while !extraction.has_begun(&b) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    drain(&mut sub).await;

    assert!(orch.cancel(&a).await.is_done());
    extraction.progress(&b, 0.4).await;
    extraction.progress(&a, 0.9).await;

    let events = drain(&mut sub).await;
    assert!(progress_of(&events, &a).is_empty());
    let b_progress = progress_of(&events, &b);
    assert_eq!(b_progress.len(), 1);
    assert_eq!(b_progress[0].progress_percent, 40.0);
    assert_eq!(b_progress[0].state, TaskState::Downloading);

    let remaining: Vec<String> = orch.list().into_iter().map(|t| t.id).collect();
    assert_eq!(remaining, vec![b.clone()]);
    assert_eq!(extraction.call_count(&format!("cancel:{}", b)), 0);
}

#[tokio::test]
async fn test_begin_failure_moves_queued_to_error() {
    let swarm = Arc::new(ScriptedTransport::swarm().failing_begin("无法识别的磁力链接"));
    let extraction = Arc::new(ScriptedTransport::extraction());
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm("magnet:?dn=broken")).unwrap();
    let failed = wait_for_state(&mut sub, &id, TaskState::Error).await;
    assert!(
        failed
            .error_detail
            .as_deref()
            .unwrap()
            .contains("无法识别的磁力链接")
    );

    match next_event(&mut sub).await {
        DownloadEvent::Error { task_id, detail } => {
            assert_eq!(task_id, id);
            assert!(detail.contains("无法识别的磁力链接"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(drain(&mut sub).await.is_empty());
}

#[tokio::test]
async fn test_begin_timeout_is_transport_unavailable() {
    let swarm = Arc::new(ScriptedTransport::swarm().with_begin_delay(Duration::from_secs(5)));
    let extraction = Arc::new(ScriptedTransport::extraction());
    let orch = DownloadOrchestrator::builder()
        .transport(swarm.clone())
        .transport(extraction.clone())
        .settings(test_settings())
        .begin_timeout(Duration::from_millis(100))
        .build();
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    let failed = wait_for_state(&mut sub, &id, TaskState::Error).await;
    assert!(failed.error_detail.unwrap().contains("传输不可用"));
}

#[tokio::test]
async fn test_transfer_failure_reports_detail_once() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    extraction
        .emit(&id, TransportEvent::Failed("HTTP Error 403".to_string()))
        .await;
    extraction
        .emit(&id, TransportEvent::Failed("again".to_string()))
        .await;

    let failed = wait_for_state(&mut sub, &id, TaskState::Error).await;
    assert_eq!(failed.error_detail.as_deref(), Some("HTTP Error 403"));

    let events = drain(&mut sub).await;
    let errors: Vec<&DownloadEvent> = events
        .iter()
        .filter(|e| matches!(e, DownloadEvent::Error { .. }))
        .collect();
    assert_eq!(
        errors,
        vec![&DownloadEvent::Error {
            task_id: id.clone(),
            detail: "HTTP Error 403".to_string()
        }]
    );
    // 失败的任务保留到调用方清理
    assert_eq!(orch.list().len(), 1);
}

#[tokio::test]
async fn test_closed_event_channel_fails_task() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    swarm.close(&id);

    let failed = wait_for_state(&mut sub, &id, TaskState::Error).await;
    assert!(failed.error_detail.is_some());
}

#[tokio::test]
async fn test_swarm_name_resolves_once() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    let downloading = wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    assert_eq!(downloading.display_name, id);

    swarm
        .emit(&id, TransportEvent::MetadataResolved("ubuntu-24.04.iso".to_string()))
        .await;
    swarm
        .emit(&id, TransportEvent::MetadataResolved("other".to_string()))
        .await;
    swarm.progress(&id, 0.1).await;

    let events = drain(&mut sub).await;
    let names: Vec<String> = progress_of(&events, &id)
        .into_iter()
        .map(|t| t.display_name)
        .collect();
    assert_eq!(names, vec!["ubuntu-24.04.iso", "ubuntu-24.04.iso"]);
}

#[tokio::test]
async fn test_caller_supplied_id_and_duplicate() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);

    let id = orch
        .start(DownloadRequest::extraction(VIDEO_A).with_id("tt0111161"))
        .unwrap();
    assert_eq!(id, "tt0111161");

    let err = orch
        .start(DownloadRequest::extraction(VIDEO_B).with_id("tt0111161"))
        .unwrap_err();
    assert_eq!(err.code(), "DuplicateId");
    assert_eq!(orch.list().len(), 1);
}

#[tokio::test]
async fn test_destination_override_wins() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);

    let id = orch
        .start(DownloadRequest::swarm(MAGNET).with_destination("/data/movies"))
        .unwrap();
    assert_eq!(orch.get(&id).unwrap().save_path, PathBuf::from("/data/movies"));
}

#[tokio::test]
async fn test_clear_finished_keeps_active_tasks() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let done = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    let failed = orch.start(DownloadRequest::extraction(VIDEO_B)).unwrap();
    let active = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    wait_for_state(&mut sub, &done, TaskState::Downloading).await;
    while !extraction.has_begun(&failed) || !swarm.has_begun(&active) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    extraction.emit(&done, TransportEvent::Completed).await;
    wait_for_state(&mut sub, &done, TaskState::Completed).await;
    extraction
        .emit(&failed, TransportEvent::Failed("boom".to_string()))
        .await;
    wait_for_state(&mut sub, &failed, TaskState::Error).await;
    drain(&mut sub).await;

    let removed = orch.clear_finished();
    assert_eq!(removed, vec![done, failed]);
    let remaining: Vec<String> = orch.list().into_iter().map(|t| t.id).collect();
    assert_eq!(remaining, vec![active]);
    assert!(drain(&mut sub).await.is_empty());
}

#[tokio::test]
async fn test_concurrency_cap_keeps_extra_tasks_queued() {
    let (swarm, extraction) = transports();
    let orch = DownloadOrchestrator::builder()
        .transport(swarm.clone())
        .transport(extraction.clone())
        .settings(test_settings())
        .max_concurrent(Some(1))
        .build();
    let mut sub = orch.subscribe();

    let first = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    let second = orch.start(DownloadRequest::extraction(VIDEO_B)).unwrap();
    wait_for_state(&mut sub, &first, TaskState::Downloading).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orch.get(&second).unwrap().state, TaskState::Queued);
    assert!(!extraction.has_begun(&second));

    extraction.emit(&first, TransportEvent::Completed).await;
    wait_for_state(&mut sub, &second, TaskState::Downloading).await;
    assert_eq!(orch.get(&first).unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn test_shutdown_tears_down_live_transfers() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let a = orch.start(DownloadRequest::swarm(MAGNET)).unwrap();
    let b = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    wait_for_state(&mut sub, &a, TaskState::Downloading).await;
    while !extraction.has_begun(&b) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    orch.shutdown().await;
    assert_eq!(swarm.call_count(&format!("cancel:{}", a)), 1);
    assert_eq!(extraction.call_count(&format!("cancel:{}", b)), 1);
    assert_eq!(orch.active_count(), 0);

    // 记录保留，但不再显示为下载中
    let tasks = orch.list();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.state == TaskState::Canceled));
    let canceled: Vec<String> = progress_of(&drain(&mut sub).await, &a)
        .into_iter()
        .map(|t| t.state.as_str().to_string())
        .collect();
    assert_eq!(canceled, vec!["canceled"]);
}

#[tokio::test]
async fn test_shutdown_keeps_finished_records_untouched() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    let id = orch.start(DownloadRequest::extraction(VIDEO_A)).unwrap();
    wait_for_state(&mut sub, &id, TaskState::Downloading).await;
    extraction.emit(&id, TransportEvent::Completed).await;
    wait_for_state(&mut sub, &id, TaskState::Completed).await;

    orch.shutdown().await;
    assert_eq!(orch.get(&id).unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn test_reused_id_after_cancel_is_independent() {
    let (swarm, extraction) = transports();
    let orch = orchestrator(&swarm, &extraction);
    let mut sub = orch.subscribe();

    orch.start(DownloadRequest::swarm(MAGNET).with_id("X")).unwrap();
    wait_for_state(&mut sub, "X", TaskState::Downloading).await;

    assert!(orch.cancel("X").await.is_done());
    // 旧任务的驱动可能还没退出
    orch.start(DownloadRequest::swarm(MAGNET).with_id("X")).unwrap();
    wait_for_state(&mut sub, "X", TaskState::Downloading).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let task = orch.get("X").unwrap();
    assert_eq!(task.state, TaskState::Downloading);
    assert!(task.error_detail.is_none());
    assert_eq!(orch.active_count(), 1);
    assert_eq!(swarm.calls(), vec!["begin:X", "cancel:X", "begin:X"]);

    // 新任务的传输仍然由调度器持有
    assert!(swarm.progress("X", 0.25).await);
    match next_event(&mut sub).await {
        DownloadEvent::Progress { task } => assert_eq!(task.progress_percent, 25.0),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(orch.cancel("X").await.is_done());
    assert_eq!(swarm.call_count("cancel:X"), 2);
}
