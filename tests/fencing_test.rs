//! Fencing scenarios driven through real agent child processes
//!
//! Run with: cargo test --test fencing_test

use regent::cib::{CibClient, CibRequest};
use regent::fencing::{
    ChildAgentRunner, FenceCommand, FenceCoordinator, FenceDevice, FenceOutcome, FenceReaction,
    HostCheck,
};
use regent::membership::{ExpectedState, JoinPhase, Liveness, PeerCache};
use regent::types::Origin;
use std::path::{Path, PathBuf};

fn write_agent(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }
}

fn agent_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("regent_fence_{}_{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn coordinator(dir: &Path) -> FenceCoordinator<ChildAgentRunner> {
    FenceCoordinator::new(
        "n1",
        ChildAgentRunner {
            agent_root: dir.to_path_buf(),
        },
    )
}

fn off_command(victim: &str) -> FenceCommand {
    FenceCommand::new("off", Some(victim), 20_000, Origin::Peer("n1".to_string()), 9)
}

/// S2: the first device claims the host but cannot act; the fallback
/// succeeds and every peer converges on the target being gone.
#[tokio::test]
async fn test_fallback_and_peer_convergence() {
    let dir = agent_dir("fallback");
    // D1 answers status but fails every off with rc 5.
    write_agent(
        &dir,
        "fence_flaky",
        "#!/bin/sh\ncase \"$1\" in status) exit 0;; off) exit 5;; esac\nexit 0\n",
    );
    // D2 succeeds.
    write_agent(&dir, "fence_solid", "#!/bin/sh\nexit 0\n");

    let mut fc = coordinator(&dir);
    let mut d1 = FenceDevice::new("d1", "fence_flaky", HostCheck::Status);
    d1.priority = 10;
    let mut d2 = FenceDevice::new("d2", "fence_solid", HostCheck::StaticList);
    d2.priority = 5;
    d2.params.insert("host_list".to_string(), "n2".to_string());
    fc.register_device(d1).unwrap();
    fc.register_device(d2).unwrap();

    let outcome = fc.execute(off_command("n2")).await;
    assert!(outcome.succeeded());
    assert_eq!(outcome.device.as_deref(), Some("d2"));

    // Broadcast handling: the peer's view converges in one round.
    let mut cache = PeerCache::new(true);
    cache.process_group_joined(2, Some("n2"));
    let (cib, mut cib_rx) = CibClient::channel();
    let reaction = fc.handle_notify(&outcome, &mut cache, &cib, true);
    assert_eq!(reaction, FenceReaction::Updated);

    let node = cache.get_by_name("n2").unwrap();
    assert_eq!(node.liveness, Liveness::Lost);
    assert_eq!(node.join, JoinPhase::None);
    assert_eq!(node.expected, Some(ExpectedState::Down));
    assert!(matches!(
        cib_rx.try_recv().unwrap(),
        CibRequest::StonithUpdate {
            quorum_override: true,
            ..
        }
    ));

    let _ = std::fs::remove_dir_all(&dir);
}

/// Exhausting every device returns the final failure to the originator.
#[tokio::test]
async fn test_all_devices_fail() {
    let dir = agent_dir("exhaust");
    write_agent(&dir, "fence_dead", "#!/bin/sh\nexit 1\n");

    let mut fc = coordinator(&dir);
    let device = FenceDevice::new("d1", "fence_dead", HostCheck::None);
    fc.register_device(device).unwrap();

    let outcome = fc.execute(off_command("n2")).await;
    assert!(!outcome.succeeded());
    assert_eq!(outcome.rc, 1);
    assert_eq!(outcome.origin, Origin::Peer("n1".to_string()));

    let _ = std::fs::remove_dir_all(&dir);
}

/// S3: a broadcast naming this node is terminal; no peer update happens,
/// the caller must halt.
#[tokio::test]
async fn test_self_fence_reaction() {
    let dir = agent_dir("selffence");
    let mut fc = coordinator(&dir);
    let mut cache = PeerCache::new(true);
    let (cib, mut cib_rx) = CibClient::channel();

    let outcome = FenceOutcome {
        target: Some("n1".to_string()),
        action: "off".to_string(),
        rc: 0,
        origin: Origin::Peer("n2".to_string()),
        id: 4,
        executioner: "n2".to_string(),
        device: Some("d9".to_string()),
    };
    assert_eq!(
        fc.handle_notify(&outcome, &mut cache, &cib, true),
        FenceReaction::SelfFenced
    );
    assert!(cib_rx.try_recv().is_err());

    let _ = std::fs::remove_dir_all(&dir);
}

/// The victim reaches the agent as `port` after alias substitution, plus
/// the raw `nodename`, on stdin.
#[tokio::test]
async fn test_agent_sees_port_and_nodename() {
    let dir = agent_dir("stdin");
    // Succeed only when both expected lines arrived on stdin.
    write_agent(
        &dir,
        "fence_check",
        "#!/bin/sh\nin=$(cat)\necho \"$in\" | grep -q '^port=plug7$' || exit 1\n\
         echo \"$in\" | grep -q '^nodename=n2$' || exit 1\nexit 0\n",
    );

    let mut fc = coordinator(&dir);
    let mut device = FenceDevice::new("d1", "fence_check", HostCheck::None);
    device
        .params
        .insert("host_map".to_string(), "n2:plug7".to_string());
    fc.register_device(device).unwrap();

    let outcome = fc.execute(off_command("n2")).await;
    assert!(outcome.succeeded(), "agent rejected its stdin parameters");

    let _ = std::fs::remove_dir_all(&dir);
}
