//! A local node in a swarm of simulated peers. Peers announce random bitfields, pull the
//! pieces we have through the rate limited upload path, and feed us pieces at a fixed rate.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use swarm_core::prelude::*;
use swarm_core::sim::SimTransport;
use swarm_core::torrent::{empty_bitfield, Bitfield};
use swarm_core::{
    BlockRequest, ConnId, EngineConfig, MemoryStorage, PeerId, PieceIndex, PieceStore, Session,
};

use crate::cli::SimulateArgs;

const TICK: Duration = Duration::from_millis(50);
const REPORT_EVERY: Duration = Duration::from_secs(1);
const BLOCK_LENGTH: u32 = 16 * 1024;

#[derive(Debug)]
struct RemotePeer {
    have: Bitfield,
    // piece the peer is pulling from us and the upload total at which it is through
    fetching: Option<(PieceIndex, u64)>,
    // piece the peer is sending us and the bytes still to come
    serving: Option<(PieceIndex, f64)>,
}

fn piece_bytes(data: &[u8], piece_length: usize, piece: PieceIndex) -> &[u8] {
    let start = piece * piece_length;
    &data[start..(start + piece_length).min(data.len())]
}

struct Swarm {
    session: Session<MemoryStorage, SimTransport>,
    peers: BTreeMap<ConnId, RemotePeer>,
    data: Vec<u8>,
    piece_length: usize,
    peer_rate: f64,
    link_rate: f64,
    corrupt: f64,
}

impl Swarm {
    fn new(args: &SimulateArgs, config: EngineConfig, rng: &mut StdRng, now: Instant) -> anyhow::Result<Self> {
        let mut data = vec![0u8; args.pieces * args.piece_length as usize];
        rng.fill_bytes(&mut data);

        let hashes = MemoryStorage::hash_pieces(args.piece_length, &data);
        let mut storage = MemoryStorage::new(args.piece_length, hashes, data.len() as u64);
        let piece_length = args.piece_length as usize;
        for (piece, bytes) in data.chunks(piece_length).enumerate() {
            if rng.gen_bool(args.have) {
                storage
                    .write_piece(piece, bytes.to_vec())
                    .context("seeding local storage")?;
            }
        }

        let mut session = Session::new(config, storage, now);
        let mut peers = BTreeMap::new();
        for id in 0..args.peers {
            let mut have = empty_bitfield(args.pieces);
            for piece in 0..args.pieces {
                have.set(piece, rng.gen_bool(args.peer_have));
            }

            let addr = SocketAddr::from((Ipv4Addr::from(0x0a00_0001 + id as u32), 6881));
            session.connection_made(id, PeerId::random(), addr, id % 2 == 0, SimTransport::bounded(), now)?;
            session.got_bitfield(id, &have)?;
            if !have.all() {
                session.got_interested(id)?;
            }
            session.got_choke(id, false)?;

            peers.insert(
                id,
                RemotePeer {
                    have,
                    fetching: None,
                    serving: None,
                },
            );
        }

        Ok(Self {
            session,
            peers,
            data,
            piece_length,
            peer_rate: args.peer_rate as f64,
            link_rate: args.link_rate as f64,
            corrupt: args.corrupt,
        })
    }

    fn is_done(&self) -> bool {
        self.session.is_complete() && self.peers.values().all(|peer| peer.have.all())
    }

    fn tick(&mut self, now: Instant, dt: f64, rng: &mut StdRng) -> anyhow::Result<()> {
        self.session.poll(now);

        let budget = (self.link_rate * dt) as usize;
        let ids: Vec<ConnId> = self.peers.keys().copied().collect();
        for id in ids {
            self.serve_peer(id, now, rng)?;
            if let Some(conn) = self.session.connection_mut(id) {
                if conn.wire_mut().transport_mut().drain(budget) {
                    self.session.connection_flushed(id, now)?;
                }
            }
            self.download_from_peer(id, dt, now, rng)?;
        }
        Ok(())
    }

    /// the remote side of our upload: request a whole piece once unchoked and take it once
    /// every block went over the link.
    fn serve_peer(&mut self, id: ConnId, now: Instant, rng: &mut StdRng) -> anyhow::Result<()> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        let Some(conn) = self.session.connection(id) else {
            return Ok(());
        };
        let choked = conn.upload().is_choked();
        let idle = !conn.wants_to_send() && conn.is_flushed();
        let total = conn.upload().total();

        match peer.fetching {
            // a choke drops whatever was still queued
            Some(_) if choked => peer.fetching = None,
            Some((piece, target)) if idle => {
                peer.fetching = None;
                if total >= target {
                    peer.have.set(piece, true);
                    self.session.got_have(id, piece, now)?;
                    if peer.have.all() {
                        debug!(peer = id, "peer is now a seed");
                        self.session.got_not_interested(id)?;
                    }
                }
            }
            Some(_) => {}
            None if !choked => {
                let numpieces = peer.have.len();
                let offset = rng.gen_range(0..numpieces);
                let picker = self.session.picker();
                let wanted = (offset..numpieces)
                    .chain(0..offset)
                    .find(|&piece| picker.has(piece) && !peer.have[piece]);
                let Some(piece) = wanted else {
                    return Ok(());
                };

                let size = piece_bytes(&self.data, self.piece_length, piece).len() as u32;
                for begin in (0..size).step_by(BLOCK_LENGTH as usize) {
                    let request = BlockRequest::new(piece, begin, BLOCK_LENGTH.min(size - begin));
                    self.session.got_request(id, request, now)?;
                }
                peer.fetching = Some((piece, total + size as u64));
            }
            None => {}
        }
        Ok(())
    }

    /// the remote side of our download: the peer streams the piece we picked at `peer_rate`.
    fn download_from_peer(&mut self, id: ConnId, dt: f64, now: Instant, rng: &mut StdRng) -> anyhow::Result<()> {
        if self.session.is_complete() {
            return Ok(());
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };

        match peer.serving {
            None => {
                if let Some(piece) = self.session.pick_piece(id, peer.have.all())? {
                    let size = piece_bytes(&self.data, self.piece_length, piece).len() as f64;
                    peer.serving = Some((piece, size));
                }
            }
            Some((piece, left)) => {
                let left = left - self.peer_rate * dt;
                if left > 0.0 {
                    peer.serving = Some((piece, left));
                    return Ok(());
                }
                peer.serving = None;
                // another peer may have finished it first
                if self.session.picker().has(piece) {
                    return Ok(());
                }
                let mut bytes = piece_bytes(&self.data, self.piece_length, piece).to_vec();
                if rng.gen_bool(self.corrupt) {
                    bytes[0] ^= 0xff;
                }
                self.session.piece_received(id, piece, bytes, now)?;
            }
        }
        Ok(())
    }
}

#[instrument(level = "info", name = "simulate", skip_all, fields(pieces = args.pieces, peers = args.peers))]
pub async fn run(args: SimulateArgs, shutdown_token: CancellationToken) -> anyhow::Result<()> {
    anyhow::ensure!(args.pieces > 0, "need at least one piece");
    anyhow::ensure!(args.piece_length > 0, "piece length must be positive");
    for (name, p) in [("have", args.have), ("peer-have", args.peer_have), ("corrupt", args.corrupt)] {
        anyhow::ensure!((0.0..=1.0).contains(&p), "--{name} must be between 0 and 1, got {p}");
    }

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(rate) = args.rate {
        config.max_upload_rate = rate;
    }
    info!(?config, "starting simulation");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut swarm = Swarm::new(&args, config, &mut rng, Instant::now())?;

    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let timeout = tokio::time::sleep(Duration::from_secs_f64(args.seconds.max(0.0)));
    tokio::pin!(timeout);

    let mut last = Instant::now();
    let mut next_report = last + REPORT_EVERY;
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = &mut timeout => break,
            _ = interval.tick() => {
                let now = Instant::now();
                let dt = now.saturating_duration_since(last).as_secs_f64();
                last = now;
                swarm.tick(now, dt, &mut rng)?;

                if now >= next_report {
                    next_report = now + REPORT_EVERY;
                    let stats = swarm.session.statistics(now, false, false);
                    info!(
                        done = stats.fraction_done,
                        up_rate = stats.up_rate,
                        down_rate = stats.down_rate,
                        copies = stats.num_copies,
                        "progress"
                    );
                }
                if swarm.is_done() {
                    info!("every node has every piece");
                    break;
                }
            }
        }
    }

    let stats = swarm.session.statistics(Instant::now(), args.spew, true);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
