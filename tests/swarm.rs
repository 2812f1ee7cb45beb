use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::rstest;

use swarm_core::sim::SimTransport;
use swarm_core::torrent::{empty_bitfield, full_bitfield};
use swarm_core::{
    BlockRequest, ConnId, EngineConfig, MemoryStorage, PeerId, PiecePicker, Session, Storage,
};

const PIECE: u32 = 16 * 1024;

fn data(pieces: usize) -> Vec<u8> {
    (0..pieces * PIECE as usize).map(|i| (i * 31 % 251) as u8).collect()
}

fn addr(id: ConnId) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, id as u8], 51413))
}

fn connect(session: &mut Session<MemoryStorage, SimTransport>, id: ConnId, now: Instant) {
    session
        .connection_made(id, PeerId::random(), addr(id), false, SimTransport::unbounded(), now)
        .unwrap();
}

fn leecher(pieces: usize, now: Instant) -> Session<MemoryStorage, SimTransport> {
    let bytes = data(pieces);
    let storage = MemoryStorage::new(PIECE, MemoryStorage::hash_pieces(PIECE, &bytes), bytes.len() as u64);
    let picker = PiecePicker::with_rng(pieces, 4, StdRng::seed_from_u64(11));
    Session::with_picker(EngineConfig::default(), storage, picker, now)
}

#[rstest]
#[case(50_000, 1000, 3)]
#[case(100_000, 1380, 4)]
#[case(30_000, 17_000, 4)]
fn capped_upload_is_fair_and_stays_on_rate(
    #[case] rate: u64,
    #[case] unitsize: usize,
    #[case] peers: usize,
) {
    let t0 = Instant::now();
    let config = EngineConfig {
        max_upload_rate: rate,
        upload_unit_size: unitsize,
        max_uploads: peers + 1,
        ..EngineConfig::default()
    };
    let mut session = Session::new(config, MemoryStorage::seeded(PIECE, &data(8)), t0);
    for id in 0..peers {
        connect(&mut session, id, t0);
        session.got_interested(id).unwrap();
    }
    session.poll(t0);
    for id in 0..peers {
        let conn = session.connection_mut(id).unwrap();
        assert!(!conn.upload().is_choked());
        conn.wire_mut().transport_mut().take_written();
    }

    for id in 0..peers {
        for piece in 0..8 {
            session
                .got_request(id, BlockRequest::new(piece, 0, PIECE), t0)
                .unwrap();
        }
    }

    let seconds = 4.0;
    for step in 1..=400 {
        session.poll(t0 + Duration::from_millis(10 * step));
    }

    let sent: Vec<usize> = (0..peers)
        .map(|id| session.connection(id).unwrap().wire().transport().written().len())
        .collect();
    let total: usize = sent.iter().sum();
    let budget = rate as f64 * seconds;
    assert!(total as f64 >= budget - unitsize as f64, "sent {total}, budget {budget}");
    assert!(total as f64 <= budget + unitsize as f64, "sent {total}, budget {budget}");

    let (min, max) = (sent.iter().min().unwrap(), sent.iter().max().unwrap());
    assert!(max - min <= 2 * unitsize, "uneven shares {sent:?}");
}

#[test]
fn lifting_the_cap_drains_everything() {
    let t0 = Instant::now();
    let config = EngineConfig {
        max_upload_rate: 10_000,
        ..EngineConfig::default()
    };
    let mut session = Session::new(config, MemoryStorage::seeded(PIECE, &data(4)), t0);
    connect(&mut session, 0, t0);
    session.got_interested(0).unwrap();
    session.poll(t0);
    for piece in 0..4 {
        session
            .got_request(0, BlockRequest::new(piece, 0, PIECE), t0)
            .unwrap();
    }
    assert!(session.connection(0).unwrap().upload().has_queries());

    let t1 = t0 + Duration::from_millis(100);
    session.set_upload_rate(0, t1);
    session.poll(session.next_wakeup().max(t1));

    let conn = session.connection(0).unwrap();
    assert!(!conn.upload().has_queries());
    assert_eq!(conn.upload().total(), 4 * PIECE as u64);
}

#[test]
fn leecher_completes_and_reports() {
    let now = Instant::now();
    let bytes = data(4);
    let mut session = leecher(4, now);
    connect(&mut session, 1, now);
    connect(&mut session, 2, now);
    session.got_bitfield(1, &full_bitfield(4)).unwrap();
    session.got_have(2, 3, now).unwrap();

    // the first delivery is corrupt
    let piece = session.pick_piece(1, true).unwrap().unwrap();
    assert!(!session.piece_received(1, piece, vec![0; PIECE as usize], now).unwrap());

    let mut rounds = 0;
    while let Some(piece) = session.pick_piece(1, true).unwrap() {
        let start = piece * PIECE as usize;
        let block = bytes[start..start + PIECE as usize].to_vec();
        assert!(session.piece_received(1, piece, block, now).unwrap());
        rounds += 1;
    }
    assert_eq!(rounds, 4);
    assert!(session.is_complete());
    assert_eq!(session.storage().left(), 0);

    let stats = session.statistics(now + Duration::from_secs(1), false, false);
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["numSeeds"], 1);
    assert_eq!(json["numPeers"], 1);
    assert_eq!(json["discarded"], PIECE as u64);
    assert_eq!(json["storage_numflunked"], 1);
    assert_eq!(json["storage_justdownloaded"], 4);
    assert_eq!(json["storage_dirty"], 0);
    assert_eq!(json["storage_active"], 0);
    assert_eq!(json["fractionDone"], 1.0);
    assert_eq!(json["timeEst"], 0.0);
    assert!(json.get("spew").is_none());
    assert!(json.get("files_left").is_none());
}

#[test]
fn distributed_copies_follow_availability() {
    let now = Instant::now();
    let mut session = leecher(4, now);
    connect(&mut session, 1, now);
    connect(&mut session, 2, now);

    let mut front = empty_bitfield(4);
    front[..2].fill(true);
    let mut back = empty_bitfield(4);
    back[2..].fill(true);
    session.got_bitfield(1, &front).unwrap();
    session.got_bitfield(2, &back).unwrap();

    let stats = session.statistics(now, false, false);
    // one full copy spread over two peers, nothing beyond it
    assert_eq!(stats.num_copies, 1);
    assert_eq!(stats.num_copy_list, vec![0.0]);

    session.got_have(2, 0, now).unwrap();
    let stats = session.statistics(now, false, false);
    assert_eq!(stats.num_copies, 1);
    assert_eq!(stats.num_copy_list, vec![0.25, 0.0]);

    session.connection_lost(2).unwrap();
    let stats = session.statistics(now, false, false);
    assert_eq!(stats.num_copies, 0);
    assert_eq!(stats.num_copy_list, vec![0.5, 0.0]);
    assert_eq!(session.picker().num_interests(0), 1);
    assert_eq!(session.picker().num_interests(3), 0);
}
