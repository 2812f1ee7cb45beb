use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;

use crate::choker::Choker;
use crate::piece_picker::PiecePicker;
use crate::prelude::*;
use crate::storage::Storage;
use crate::torrent::PeerId;
use crate::ConnId;

/// upload side of one connection as shown in the spew table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UploadView {
    pub total: u64,
    pub rate: f64,
    pub interested: bool,
    pub choked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DownloadView {
    pub total: u64,
    pub rate: f64,
    pub interested: bool,
    pub choked: bool,
    pub snubbed: bool,
}

/// everything the report needs to know about one connection, taken at report time.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub locally_initiated: bool,
    pub upload: UploadView,
    pub download: DownloadView,
    /// the peer has every piece
    pub is_seed: bool,
    /// fraction of pieces the peer has
    pub completed: f64,
    /// how fast the peer downloads from the swarm as a whole
    pub speed: f64,
}

/// session wide transfer rates, all in bytes/sec or bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferRates {
    pub up_rate: f64,
    pub up_rate2: f64,
    pub up_total: u64,
    pub down_rate: f64,
    pub down_total: u64,
}

/// the pieces of a session a report is built from.
pub struct SwarmSnapshot<'a> {
    pub picker: &'a PiecePicker,
    pub storage: &'a dyn Storage,
    pub choker: &'a dyn Choker,
    pub peers: &'a HashMap<ConnId, PeerSnapshot>,
    pub rates: TransferRates,
    /// bytes thrown away because they failed the hash check
    pub discarded: u64,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpewEntry {
    pub id: PeerId,
    pub ip: IpAddr,
    pub is_optimistic_unchoke: bool,
    /// 'L' if we opened the connection, 'R' if the peer did
    pub initiation: char,
    pub upload: UploadView,
    pub download: DownloadView,
    pub completed: f64,
    pub speed: f64,
}

/// status report handed to the ui.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub num_seeds: usize,
    pub num_peers: usize,
    pub up_rate: f64,
    pub up_rate2: f64,
    pub up_total: u64,
    pub down_rate: f64,
    pub down_total: u64,
    /// number of complete copies of the torrent in the swarm besides seeds and ourselves
    pub num_copies: i64,
    /// fraction of pieces with more copies than that, for the next few levels
    pub num_copy_list: Vec<f64>,
    pub discarded: u64,
    #[serde(rename = "storage_numcomplete")]
    pub storage_numcomplete: usize,
    #[serde(rename = "storage_dirty")]
    pub storage_dirty: usize,
    #[serde(rename = "storage_active")]
    pub storage_active: usize,
    #[serde(rename = "storage_numflunked")]
    pub storage_numflunked: usize,
    #[serde(rename = "storage_justdownloaded")]
    pub storage_justdownloaded: usize,
    #[serde(rename = "storage_numfound")]
    pub storage_numfound: usize,
    /// seconds left at the current download rate
    pub time_est: Option<f64>,
    pub fraction_done: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spew: Option<Vec<SpewEntry>>,
    #[serde(rename = "files_left", skip_serializing_if = "Option::is_none")]
    pub files_left: Option<Vec<u64>>,
    #[serde(rename = "files_allocated", skip_serializing_if = "Option::is_none")]
    pub files_allocated: Option<Vec<bool>>,
}

/// builds [`Statistics`] out of a [`SwarmSnapshot`]. the only state kept between calls is the
/// row order of the last spew table, so rows stay put while the ui refreshes.
#[derive(Debug, Default)]
pub struct DownloaderFeedback {
    lastids: Vec<ConnId>,
}

impl DownloaderFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// choker order rotated so that it starts with the first connection of the previous table
    /// that is still around.
    fn rotate(&self, connections: &[ConnId]) -> Vec<ConnId> {
        for id in &self.lastids {
            if let Some(start) = connections.iter().position(|c| c == id) {
                let mut rotated = connections[start..].to_vec();
                rotated.extend_from_slice(&connections[..start]);
                return rotated;
            }
        }
        connections.to_vec()
    }

    fn collect_spew(&mut self, snapshot: &SwarmSnapshot<'_>) -> Vec<SpewEntry> {
        let order = snapshot.choker.connections();
        let optimistic = order.first().copied();
        let rotated = self.rotate(order);

        let spew: Vec<SpewEntry> = rotated
            .iter()
            .filter_map(|conn| {
                let peer = snapshot.peers.get(conn)?;
                Some(SpewEntry {
                    id: peer.peer_id.clone(),
                    ip: peer.ip,
                    is_optimistic_unchoke: Some(*conn) == optimistic,
                    initiation: if peer.locally_initiated { 'L' } else { 'R' },
                    upload: peer.upload,
                    download: peer.download,
                    completed: peer.completed,
                    speed: peer.speed,
                })
            })
            .collect();

        self.lastids = rotated;
        spew
    }

    /// walks the copy histogram: levels where every piece is covered count as full copies,
    /// the first few partially covered levels become fractions.
    fn copies(picker: &PiecePicker, num_seeds: usize) -> (i64, Vec<f64>) {
        let numpieces = picker.numpieces();
        let mut missing = 0;
        let mut num_copies: i64 = 0;
        let mut num_copy_list = Vec::new();

        for &count in picker.crosscount() {
            missing += count;
            if missing == 0 {
                num_copies += 1;
                continue;
            }
            let fraction = 1.0 - missing as f64 / numpieces as f64;
            num_copy_list.push(fraction);
            if fraction == 0.0 || num_copy_list.len() >= 3 {
                break;
            }
        }

        num_copies -= num_seeds as i64;
        if picker.am_i_complete() {
            num_copies -= 1;
        }
        (num_copies, num_copy_list)
    }

    pub fn get_statistics(
        &mut self,
        snapshot: &SwarmSnapshot<'_>,
        spew: bool,
        files: bool,
    ) -> Statistics {
        let num_seeds = snapshot.peers.values().filter(|p| p.is_seed).count();
        let num_peers = snapshot.peers.len() - num_seeds;
        let (num_copies, num_copy_list) = Self::copies(snapshot.picker, num_seeds);
        let storage = snapshot.storage.stats();
        let rates = snapshot.rates;

        let (down_rate, time_est, fraction_done) = if snapshot.finished {
            (0.0, Some(0.0), 1.0)
        } else {
            let left = snapshot.storage.left() as f64;
            let total = snapshot.storage.total_length();
            let fraction_done = if total == 0 {
                1.0
            } else {
                1.0 - left / total as f64
            };
            let time_est = (rates.down_rate > 0.0).then(|| left / rates.down_rate);
            (rates.down_rate, time_est, fraction_done)
        };

        let spew = spew.then(|| self.collect_spew(snapshot));
        trace!(num_seeds, num_peers, num_copies, "collected statistics");

        Statistics {
            num_seeds,
            num_peers,
            up_rate: rates.up_rate,
            up_rate2: rates.up_rate2,
            up_total: rates.up_total,
            down_rate,
            down_total: rates.down_total,
            num_copies,
            num_copy_list,
            discarded: snapshot.discarded,
            storage_numcomplete: storage.numfound + storage.numdownloaded,
            storage_dirty: storage.dirty,
            storage_active: storage.active,
            storage_numflunked: storage.numflunked,
            storage_justdownloaded: storage.numdownloaded,
            storage_numfound: storage.numfound,
            time_est,
            fraction_done,
            spew,
            files_left: files.then(|| snapshot.storage.files_left()),
            files_allocated: files.then(|| snapshot.storage.files_allocated()),
        }
    }
}
