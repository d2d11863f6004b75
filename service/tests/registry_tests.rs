//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Registration lifecycle and query tests

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use umaster_codec::{Heartbeat, Message};
use umaster_service::{
    BanGate, HeartbeatMachine, HeartbeatPolicy, HeartbeatReply, HeartbeatState, QueryHandler,
    ServerKey, ServerRegistry,
};

struct Fixture {
    registry: Arc<ServerRegistry>,
    bans: Arc<BanGate>,
    heartbeats: Arc<HeartbeatMachine>,
    queries: QueryHandler,
}

fn fixture(policy: HeartbeatPolicy) -> Fixture {
    let registry = Arc::new(ServerRegistry::from_policy(&policy));
    let bans = Arc::new(BanGate::new());
    Fixture {
        heartbeats: Arc::new(HeartbeatMachine::new(registry.clone(), bans.clone(), policy)),
        queries: QueryHandler::new(registry.clone(), bans.clone()),
        registry,
        bans,
    }
}

fn peer(a: u8, b: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, a, b)), 40000)
}

fn heartbeat(game: &str, port: u16, metadata: &[(&str, &str)]) -> Heartbeat {
    Heartbeat {
        game: game.to_string(),
        port,
        metadata: metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn listed(messages: &[Message]) -> Vec<(String, u16)> {
    messages
        .iter()
        .flat_map(|message| match message {
            Message::ServerList(list) => list.servers.clone(),
            other => panic!("unexpected reply {other:?}"),
        })
        .map(|record| (record.address, record.port))
        .collect()
}

#[test]
fn test_repeated_heartbeats_keep_one_entry() {
    let fx = fixture(HeartbeatPolicy::default());
    let now = Instant::now();

    for (n, map) in ["dm-deck16", "ctf-face", "dm-morpheus"].iter().enumerate() {
        let reply = fx
            .heartbeats
            .heartbeat_at(
                peer(0, 1),
                heartbeat("ut", 7777, &[("mapname", map)]),
                now + Duration::from_secs(n as u64),
            )
            .unwrap();
        assert_eq!(reply, HeartbeatReply::Ack { interval_secs: 60 });
    }

    assert_eq!(fx.registry.len(), 1);
    let key = ServerKey::new(peer(0, 1).ip(), 7777);
    let server = fx.registry.get(&key).unwrap();
    assert_eq!(server.metadata.get("mapname"), Some("dm-morpheus"));
}

#[test]
fn test_silent_server_goes_stale_then_disappears() {
    let policy = HeartbeatPolicy::default()
        .with_interval(Duration::from_secs(10))
        .with_timeout_multiplier(3)
        .with_stale_grace(Duration::from_secs(20));
    let fx = fixture(policy);
    let start = Instant::now();
    let key = ServerKey::new(peer(0, 2).ip(), 7777);

    fx.heartbeats
        .heartbeat_at(peer(0, 2), heartbeat("ut", 7777, &[]), start)
        .unwrap();
    assert_eq!(fx.heartbeats.state_of_at(&key, start), HeartbeatState::Registered);

    let stale_at = start + Duration::from_secs(31);
    assert_eq!(fx.heartbeats.state_of_at(&key, stale_at), HeartbeatState::Stale);
    assert!(listed(&fx.queries.respond_at(&[], 1200, stale_at)).is_empty());
    let report = fx.registry.sweep_at(stale_at);
    assert_eq!((report.stale, report.removed), (1, 0));
    assert!(fx.registry.contains(&key));

    let gone_at = start + Duration::from_secs(51);
    let report = fx.registry.sweep_at(gone_at);
    assert_eq!((report.stale, report.removed), (0, 1));
    assert_eq!(fx.heartbeats.state_of_at(&key, gone_at), HeartbeatState::Unregistered);
}

#[test]
fn test_stale_server_recovers_on_heartbeat() {
    let policy = HeartbeatPolicy::default().with_interval(Duration::from_secs(10));
    let fx = fixture(policy);
    let start = Instant::now();
    let key = ServerKey::new(peer(0, 3).ip(), 7777);

    fx.heartbeats
        .heartbeat_at(peer(0, 3), heartbeat("ut", 7777, &[]), start)
        .unwrap();
    let later = start + Duration::from_secs(45);
    assert_eq!(fx.heartbeats.state_of_at(&key, later), HeartbeatState::Stale);

    fx.heartbeats
        .heartbeat_at(peer(0, 3), heartbeat("ut", 7777, &[]), later)
        .unwrap();
    assert_eq!(fx.heartbeats.state_of_at(&key, later), HeartbeatState::Registered);
    assert_eq!(listed(&fx.queries.respond_at(&[], 1200, later)).len(), 1);
}

#[test]
fn test_challenge_flow() {
    let fx = fixture(HeartbeatPolicy::default().with_require_challenge(true));
    let now = Instant::now();
    let key = ServerKey::new(peer(0, 4).ip(), 7777);

    let HeartbeatReply::Challenge { nonce } = fx
        .heartbeats
        .heartbeat_at(peer(0, 4), heartbeat("ut", 7777, &[]), now)
        .unwrap()
    else {
        panic!("first heartbeat must be challenged");
    };
    assert_eq!(fx.heartbeats.state_of_at(&key, now), HeartbeatState::AwaitingAck);
    assert!(fx.registry.is_empty());

    assert!(
        fx.heartbeats
            .challenge_response_at(peer(0, 4), nonce.wrapping_add(1), 7777, now)
            .is_err()
    );
    fx.heartbeats
        .challenge_response_at(peer(0, 4), nonce, 7777, now)
        .unwrap();
    assert_eq!(fx.heartbeats.state_of_at(&key, now), HeartbeatState::Registered);
    assert!(fx.registry.get(&key).unwrap().validated);
}

#[test]
fn test_query_filters_and_ban_exclusion() {
    let fx = fixture(HeartbeatPolicy::default());
    let now = Instant::now();
    fx.heartbeats
        .heartbeat_at(peer(0, 5), heartbeat("ut", 7777, &[("gametype", "CTF")]), now)
        .unwrap();
    fx.heartbeats
        .heartbeat_at(peer(0, 6), heartbeat("ut", 7777, &[("gametype", "DM")]), now)
        .unwrap();
    fx.heartbeats
        .heartbeat_at(peer(0, 7), heartbeat("unreal", 7777, &[]), now)
        .unwrap();

    let filters = vec![("game".to_string(), "ut".to_string())];
    assert_eq!(listed(&fx.queries.respond_at(&filters, 1200, now)).len(), 2);

    let filters = vec![
        ("game".to_string(), "UT".to_string()),
        ("gametype".to_string(), "ctf".to_string()),
    ];
    assert_eq!(
        listed(&fx.queries.respond_at(&filters, 1200, now)),
        vec![("10.1.0.5".to_string(), 7777)]
    );

    fx.bans.ban(peer(0, 5).ip(), None, None);
    assert!(listed(&fx.queries.respond_at(&filters, 1200, now)).is_empty());
    assert_eq!(fx.registry.len(), 3);
}

#[test]
fn test_large_list_is_fragmented() {
    let fx = fixture(HeartbeatPolicy::default());
    let now = Instant::now();
    for n in 0..300u16 {
        let hostname = format!("Public server number {n} with a long name");
        fx.heartbeats
            .heartbeat_at(
                peer((n / 200) as u8, (n % 200) as u8),
                heartbeat("ut", 7777, &[("hostname", hostname.as_str())]),
                now,
            )
            .unwrap();
    }

    let fragments = fx.queries.respond_at(&[], 1200, now);
    assert!(fragments.len() > 1);
    for (index, fragment) in fragments.iter().enumerate() {
        let Message::ServerList(list) = fragment else {
            panic!("unexpected reply {fragment:?}");
        };
        assert_eq!(list.sequence as usize, index);
        assert_eq!(list.total as usize, fragments.len());
        assert!(!list.servers.is_empty());
        assert!(fragment.encode().len() <= 1200);
    }

    let mut addresses: Vec<_> = listed(&fragments).into_iter().map(|(a, _)| a).collect();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 300);
}

#[test]
fn test_empty_list_still_answers() {
    let fx = fixture(HeartbeatPolicy::default());
    let fragments = fx.queries.respond(&[], 1200);
    assert_eq!(fragments.len(), 1);
    let Message::ServerList(list) = &fragments[0] else {
        panic!("unexpected reply");
    };
    assert_eq!((list.sequence, list.total), (0, 1));
    assert!(list.servers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_heartbeats_from_many_servers() {
    let fx = fixture(HeartbeatPolicy::default());
    let mut tasks = Vec::new();
    for n in 0..1000u16 {
        let heartbeats = fx.heartbeats.clone();
        tasks.push(tokio::spawn(async move {
            let peer = peer((n / 250) as u8, (n % 250) as u8);
            for _ in 0..3 {
                heartbeats
                    .heartbeat(peer, heartbeat("ut", 7777, &[("round", "1")]))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(fx.registry.len(), 1000);
    assert_eq!(listed(&fx.queries.respond(&[], 1200)).len(), 1000);
}
