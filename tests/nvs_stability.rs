use std::time::Duration;

use meshx::nvs::Nvs;
use meshx::os::TimerService;
use meshx::MeshxError;
use tempfile::tempdir;

const CID: u16 = 0x7908;
const PID: u16 = 0x0004;

#[tokio::test]
async fn burst_of_armed_writes_commits_once_after_quiet_window() {
    let dir = tempdir().unwrap();
    let nvs = Nvs::init(dir.path().join("nvs"), TimerService::new()).unwrap();
    nvs.open(CID, PID, 100).unwrap();
    let base = nvs.commit_count();

    nvs.set("k1", b"v1", true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    nvs.set("k1", b"v2", true).unwrap();

    // 60 ms after the second write the window has not closed yet
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(nvs.commit_count(), base);

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert_eq!(nvs.commit_count(), base + 1);
    assert_eq!(nvs.get("k1").unwrap(), b"v2");

    // and nothing further without new writes
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(nvs.commit_count(), base + 1);
    nvs.close().unwrap();
}

#[tokio::test]
async fn unarmed_writes_wait_for_explicit_commit() {
    let dir = tempdir().unwrap();
    let nvs = Nvs::init(dir.path().join("nvs"), TimerService::new()).unwrap();
    nvs.open(CID, PID, 40).unwrap();
    // let the identity-check write settle
    tokio::time::sleep(Duration::from_millis(80)).await;
    let base = nvs.commit_count();

    nvs.set("quiet", &[7], false).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nvs.commit_count(), base);

    nvs.commit().unwrap();
    assert_eq!(nvs.commit_count(), base + 1);
    nvs.close().unwrap();
}

#[tokio::test]
async fn zero_window_never_commits_on_its_own() {
    let dir = tempdir().unwrap();
    let nvs = Nvs::init(dir.path().join("nvs"), TimerService::new()).unwrap();
    nvs.open(CID, PID, 0).unwrap();
    nvs.set("k", &[1], true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(nvs.commit_count(), 0);
    nvs.close().unwrap();
}

#[tokio::test]
async fn value_round_trips_through_a_new_handle() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("nvs");
    {
        let nvs = Nvs::init(&root, TimerService::new()).unwrap();
        nvs.open(CID, PID, 0).unwrap();
        nvs.set_value("counter", &0xDEAD_BEEFu32, true).unwrap();
        nvs.commit().unwrap();
        nvs.close().unwrap();
    }

    let nvs = Nvs::init(&root, TimerService::new()).unwrap();
    nvs.open(CID, PID, 0).unwrap();
    assert_eq!(nvs.get_value::<u32>("counter").unwrap(), 0xDEAD_BEEF);
    let mut wrong = [0u8; 2];
    assert!(matches!(
        nvs.get_into("counter", &mut wrong),
        Err(MeshxError::SizeMismatch { stored: 4, buffer: 2 })
    ));
    nvs.close().unwrap();
}

#[tokio::test]
async fn close_deletes_the_commit_timer() {
    let dir = tempdir().unwrap();
    let timers = TimerService::new();
    let nvs = Nvs::init(dir.path().join("nvs"), timers.clone()).unwrap();
    nvs.open(CID, PID, 100).unwrap();
    assert_eq!(timers.active_count(), 1);
    nvs.close().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(timers.active_count(), 0);
}
