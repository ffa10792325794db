// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prefix-token-block cache.
//!
//! Prompts with long shared prefixes should land on pods that already hold
//! the prefix's KV state. The index is content-addressed: the token sequence
//! is cut into fixed-size windows, each window is hashed, and a block maps
//! that hash to the (model, pod) placements known to cache it. The final
//! short window of a sequence is hashed like a full one, so a whole prompt
//! round-trips through [`PrefixIndex::add_blocks`] and
//! [`PrefixIndex::match_prefix`] exactly.
//!
//! The window hash is XXH64 (seed 0) over the token IDs as 4-byte
//! little-endian words: a pure function of the tokens, stable across runs
//! and hosts.
//!
//! A reader/writer lock guards the block map. Match is the hot path: it runs
//! under the shared lock and copies the surviving pod set out; the block's
//! last-access stamp is an atomic so hits can refresh it without upgrading
//! the lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use xxhash_rust::xxh64::xxh64;

/// A token ID as produced by the (external) tokenizer.
pub type Token = u32;

/// One content-addressed block: which pods cache it, per model.
struct PrefixBlock {
    /// model name -> pod name -> last time that placement was refreshed.
    models: HashMap<String, HashMap<String, SystemTime>>,
    /// Block-level last access, epoch milliseconds. Refreshed by every hit.
    last_access_ms: AtomicU64,
}

impl PrefixBlock {
    fn new(now_ms: u64) -> Self {
        Self {
            models: HashMap::new(),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }
}

/// The result of matching a prompt against the index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrefixMatch {
    /// Tokens covered by consecutive window hits, in order.
    pub matched: Vec<Token>,
    /// Everything from the first miss onward.
    pub unmatched: Vec<Token>,
    /// Candidate pods that cache *every* matched window, in candidate order.
    /// Empty when nothing matched.
    pub pods: Vec<String>,
}

/// Content-addressed prefix cache over fixed-size token windows.
pub struct PrefixIndex {
    block_size: usize,
    blocks: RwLock<HashMap<u64, PrefixBlock>>,
}

impl PrefixIndex {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "prefix block size must be non-zero");
        Self {
            block_size,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Walk the prompt window by window. A window is a hit when its block
    /// exists, carries an entry for `model`, and that entry's pod set
    /// intersects `candidate_pods`; the surviving pod set is the running
    /// intersection across hits. The first miss stops the walk.
    ///
    /// Pure with respect to routing state: the only mutation is refreshing
    /// the last-access stamp of blocks that hit.
    pub fn match_prefix(
        &self,
        tokens: &[Token],
        model: &str,
        candidate_pods: &[String],
    ) -> PrefixMatch {
        let now_ms = epoch_ms(SystemTime::now());
        let blocks = self.blocks.read().expect("prefix lock poisoned");

        let mut matched_len = 0;
        let mut surviving: Option<HashSet<&str>> = None;

        for (start, end) in windows(tokens.len(), self.block_size) {
            let hash = window_hash(&tokens[start..end]);
            let Some(block) = blocks.get(&hash) else {
                break;
            };
            let Some(placements) = block.models.get(model) else {
                break;
            };
            let hit: HashSet<&str> = candidate_pods
                .iter()
                .map(String::as_str)
                .filter(|pod| placements.contains_key(*pod))
                .collect();
            if hit.is_empty() {
                break;
            }

            block.last_access_ms.store(now_ms, Ordering::Relaxed);
            surviving = Some(match surviving {
                None => hit,
                Some(previous) => previous.intersection(&hit).copied().collect(),
            });
            matched_len = end;
        }

        let pods = match surviving {
            Some(set) => candidate_pods
                .iter()
                .filter(|pod| set.contains(pod.as_str()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        PrefixMatch {
            matched: tokens[..matched_len].to_vec(),
            unmatched: tokens[matched_len..].to_vec(),
            pods,
        }
    }

    /// Record that `pod` now caches every window of `tokens` for `model`.
    pub fn add_blocks(&self, tokens: &[Token], model: &str, pod: &str) {
        let now = SystemTime::now();
        let now_ms = epoch_ms(now);
        let mut blocks = self.blocks.write().expect("prefix lock poisoned");
        for (start, end) in windows(tokens.len(), self.block_size) {
            let hash = window_hash(&tokens[start..end]);
            let block = blocks.entry(hash).or_insert_with(|| PrefixBlock::new(now_ms));
            block
                .models
                .entry(model.to_string())
                .or_default()
                .insert(pod.to_string(), now);
            block.last_access_ms.store(now_ms, Ordering::Relaxed);
        }
    }

    /// Remove every block whose last access is older than `threshold`.
    /// Eviction is whole-block; per-model or per-pod trimming inside a block
    /// is not supported.
    pub fn evict(&self, threshold: SystemTime) {
        let threshold_ms = epoch_ms(threshold);
        let mut blocks = self.blocks.write().expect("prefix lock poisoned");
        let before = blocks.len();
        blocks.retain(|_, block| block.last_access_ms.load(Ordering::Relaxed) >= threshold_ms);
        let evicted = before - blocks.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = blocks.len(), "prefix blocks evicted");
        }
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().expect("prefix lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `[start, end)` bounds of each window, the trailing short one included.
fn windows(len: usize, block_size: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..len)
        .step_by(block_size)
        .map(move |start| (start, (start + block_size).min(len)))
}

/// Stable 64-bit hash of one token window.
pub fn window_hash(tokens: &[Token]) -> u64 {
    let bytes: Vec<u8> = tokens.iter().flat_map(|token| token.to_le_bytes()).collect();
    xxh64(&bytes, 0)
}

/// Hashes of every window of a sequence, in order.
pub fn sequence_hashes(tokens: &[Token], block_size: usize) -> Vec<u64> {
    windows(tokens.len(), block_size)
        .map(|(start, end)| window_hash(&tokens[start..end]))
        .collect()
}

fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
