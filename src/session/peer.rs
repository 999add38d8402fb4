use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rand::{CryptoRng, RngCore};
use tracing::{debug, info, instrument, warn};

use super::messages::{Envelope, PeerMessage};
use super::transport::PeerTransport;
use crate::clock::SharedClock;
use crate::config::FairnessConfig;
use crate::encryption::{EncryptedTile, PeeledTile};
use crate::error::FairnessError;
use crate::game::{
    ActionDraft, ActionPayload, ActionType, DefaultStateConflictResolver, GameAction, HandJudge,
    Resolution, StateConflictResolver, StateSummary,
};
use crate::keys::{PeerKeys, PeerPublicKeys};
use crate::ledger::types::{ActionId, GameId, PeerId};
use crate::ledger::{VerificationManager, VerifyError};
use crate::postgame::{
    FinalGameState, KeyDisclosureRequest, PostGameState, PostGameVerifier, VerificationData,
};
use crate::proofs::{DecryptionProof, DecryptionProofService, ProofExport};
use crate::shuffling::{EncryptedDeck, ShuffleError, ShuffleOrchestrator, ShufflePhase};
use crate::tiles::{full_tile_set, Tile};

const LOG_TARGET: &str = "legit_mahjong::session";

/// What handling one inbound envelope changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerAnnounced { peer_id: PeerId, table_ready: bool },
    DeckAccepted { from: PeerId, complete: bool },
    ActionAccepted { action_id: ActionId, peer_id: PeerId },
    ProofAccepted {
        peer_id: PeerId,
        tile_index: u32,
        opened: Option<Tile>,
    },
    KeyDisclosed { peer_id: PeerId },
    StateCompared {
        peer_id: PeerId,
        in_sync: bool,
        resolution: Resolution,
    },
    Aborted { by: PeerId, reason: String },
}

/// One peer's view of a game: its keys, the shuffle, the live action log,
/// its decryption proofs and the disclosures it has seen.
pub struct PeerSession<T: PeerTransport> {
    keys: PeerKeys,
    game_id: GameId,
    seats: Vec<PeerId>,
    config: FairnessConfig,
    clock: SharedClock,
    transport: T,
    roster: RwLock<BTreeMap<PeerId, PeerPublicKeys>>,
    orchestrator: OnceLock<ShuffleOrchestrator>,
    verifier: VerificationManager,
    proofs: DecryptionProofService,
    remote_proofs: RwLock<BTreeMap<PeerId, BTreeMap<u32, DecryptionProof>>>,
    /// Latest known form of every tile someone has started opening.
    reveals: RwLock<BTreeMap<u32, PeeledTile>>,
    disclosures: RwLock<BTreeMap<PeerId, KeyDisclosureRequest>>,
    resolver: Box<dyn StateConflictResolver>,
    aborted: RwLock<Option<String>>,
}

impl<T: PeerTransport> PeerSession<T> {
    /// `seats` lists every peer in seat order, dealer first.
    pub fn new(
        keys: PeerKeys,
        game_id: impl Into<GameId>,
        seats: Vec<PeerId>,
        config: &FairnessConfig,
        clock: SharedClock,
        transport: T,
    ) -> Self {
        let game_id = game_id.into();
        let verifier = VerificationManager::new(game_id.clone(), config, clock.clone());
        let proofs =
            DecryptionProofService::new(keys.peer_id.clone(), keys.signing.clone(), clock.clone());
        let mut roster = BTreeMap::new();
        roster.insert(keys.peer_id.clone(), keys.public());
        Self {
            keys,
            game_id,
            seats,
            config: config.clone(),
            clock,
            transport,
            roster: RwLock::new(roster),
            orchestrator: OnceLock::new(),
            verifier,
            proofs,
            remote_proofs: RwLock::new(BTreeMap::new()),
            reveals: RwLock::new(BTreeMap::new()),
            disclosures: RwLock::new(BTreeMap::new()),
            resolver: Box::new(DefaultStateConflictResolver),
            aborted: RwLock::new(None),
        }
    }

    pub fn with_resolver(mut self, resolver: impl StateConflictResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.keys.peer_id
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn seats(&self) -> &[PeerId] {
        &self.seats
    }

    pub fn verifier(&self) -> &VerificationManager {
        &self.verifier
    }

    pub fn aborted(&self) -> Option<String> {
        self.aborted.read().clone()
    }

    pub fn is_table_ready(&self) -> bool {
        self.orchestrator.get().is_some()
    }

    /// Announced keys in seat order, once every seat has announced.
    pub fn announcements(&self) -> Option<Vec<PeerPublicKeys>> {
        let roster = self.roster.read();
        self.seats
            .iter()
            .map(|peer| roster.get(peer).cloned())
            .collect()
    }

    pub async fn announce(&self) -> Result<(), FairnessError> {
        self.transport
            .broadcast(PeerMessage::Announce(self.keys.public()))
            .await?;
        self.try_ready()?;
        Ok(())
    }

    fn try_ready(&self) -> Result<bool, FairnessError> {
        if self.is_table_ready() {
            return Ok(true);
        }
        let Some(announcements) = self.announcements() else {
            return Ok(false);
        };
        let orchestrator =
            ShuffleOrchestrator::new(announcements.clone(), &self.config, self.clock.clone())?;
        self.verifier.register_peers(announcements.iter());
        if self.orchestrator.set(orchestrator).is_ok() {
            info!(target: LOG_TARGET, peer_id = %self.keys.peer_id, seats = self.seats.len(), "table ready");
        }
        Ok(true)
    }

    fn orchestrator(&self) -> Result<&ShuffleOrchestrator, FairnessError> {
        self.orchestrator
            .get()
            .ok_or(FairnessError::Shuffle(ShuffleError::NotInitialized))
    }

    pub fn deck(&self) -> Option<EncryptedDeck> {
        self.orchestrator.get().and_then(ShuffleOrchestrator::deck)
    }

    pub fn is_shuffle_complete(&self) -> bool {
        self.orchestrator
            .get()
            .is_some_and(ShuffleOrchestrator::is_shuffle_complete)
    }

    pub fn is_my_shuffle_turn(&self) -> bool {
        self.orchestrator
            .get()
            .and_then(ShuffleOrchestrator::current_peer)
            .is_some_and(|peer| peer == self.keys.peer_id)
    }

    /// Runs this peer's shuffle pass if it is its turn and hands the deck on.
    /// Returns whether a pass was made.
    pub async fn take_shuffle_turn<R>(&self, rng: &mut R) -> Result<bool, FairnessError>
    where
        R: RngCore + CryptoRng + Send,
    {
        if !self.is_my_shuffle_turn() {
            return Ok(false);
        }
        let orchestrator = self.orchestrator()?;
        let deck = match orchestrator.phase() {
            ShufflePhase::Uninitialized => orchestrator.initialize_deck(
                rng,
                full_tile_set(self.config.copies_per_kind),
                &self.keys,
            )?,
            _ => orchestrator.perform_current_player_shuffle(rng, &self.keys)?,
        };
        self.transport
            .broadcast(PeerMessage::DeckHandoff(deck))
            .await?;
        Ok(true)
    }

    /// Signs, logs and broadcasts one of this peer's own actions.
    pub async fn act(&self, payload: &ActionPayload) -> Result<GameAction, FairnessError> {
        let action = self.verifier.signatures().sign(
            ActionDraft::new(self.keys.peer_id.clone(), payload),
            &self.keys.signing,
        );
        self.verifier.verify_and_log_action(&action)?;
        self.transport
            .broadcast(PeerMessage::Action(action.clone()))
            .await?;
        Ok(action)
    }

    /// Removes this peer's layer from the tile at `tile_index`, proves it and
    /// broadcasts the proof. Layers come off in reverse seat order.
    #[instrument(skip(self), fields(peer_id = %self.keys.peer_id), level = "trace")]
    pub async fn reveal_layer(&self, tile_index: u32) -> Result<PeeledTile, FairnessError> {
        let tile = match self.current_form(tile_index)? {
            PeeledTile::Open(tile) => return Ok(PeeledTile::Open(tile)),
            PeeledTile::Layered(tile) => tile,
        };
        let owner = tile
            .layer_count()
            .checked_sub(1)
            .and_then(|outer| self.seats.get(outer));
        if owner != Some(&self.keys.peer_id) {
            return Err(ShuffleError::OutOfTurn {
                expected: owner.cloned().unwrap_or_default(),
                actual: self.keys.peer_id.clone(),
            }
            .into());
        }
        let (peeled, proof) =
            self.proofs
                .peel_and_prove(tile_index, &tile, self.keys.encryption.secret())?;
        self.reveals.write().insert(tile_index, peeled.clone());
        self.transport
            .broadcast(PeerMessage::DecryptionProof(proof))
            .await?;
        Ok(peeled)
    }

    fn current_form(&self, tile_index: u32) -> Result<PeeledTile, FairnessError> {
        if let Some(form) = self.reveals.read().get(&tile_index) {
            return Ok(form.clone());
        }
        self.deck()
            .and_then(|deck| deck.tile(tile_index as usize).cloned())
            .map(PeeledTile::Layered)
            .ok_or(FairnessError::Shuffle(ShuffleError::NotInitialized))
    }

    /// Plaintext of a tile once every layer is off.
    pub fn opened_tile(&self, tile_index: u32) -> Option<Tile> {
        match self.reveals.read().get(&tile_index) {
            Some(PeeledTile::Open(tile)) => Some(*tile),
            _ => None,
        }
    }

    pub async fn disclose_key(&self) -> Result<KeyDisclosureRequest, FairnessError> {
        let request =
            KeyDisclosureRequest::new(self.game_id.clone(), &self.keys, self.clock.now_millis());
        self.disclosures
            .write()
            .insert(self.keys.peer_id.clone(), request.clone());
        info!(target: LOG_TARGET, peer_id = %self.keys.peer_id, "disclosing encryption key");
        self.transport
            .broadcast(PeerMessage::KeyDisclosure(request.clone()))
            .await?;
        Ok(request)
    }

    pub fn disclosures_complete(&self) -> bool {
        let disclosures = self.disclosures.read();
        self.seats.iter().all(|peer| disclosures.contains_key(peer))
    }

    pub fn summary(&self) -> StateSummary {
        let turn = self
            .verifier
            .logged_actions()
            .iter()
            .filter(|action| action.action_type == ActionType::Discard)
            .count();
        StateSummary {
            game_id: self.game_id.clone(),
            peer_id: self.keys.peer_id.clone(),
            turn: turn as u32,
            last_action_time: self.verifier.last_action_time(),
            action_count: self.verifier.log_len(),
            log_head: self.verifier.log_head(),
        }
    }

    pub async fn sync_state(&self) -> Result<(), FairnessError> {
        self.transport
            .broadcast(PeerMessage::StateSync(self.summary()))
            .await?;
        Ok(())
    }

    pub async fn abort(&self, reason: impl Into<String>) -> Result<(), FairnessError> {
        let reason = reason.into();
        self.record_abort(&self.keys.peer_id, &reason);
        self.transport
            .broadcast(PeerMessage::Abort { reason })
            .await?;
        Ok(())
    }

    fn record_abort(&self, by: &str, reason: &str) {
        warn!(target: LOG_TARGET, peer_id = %self.keys.peer_id, by, reason, "game aborted");
        self.aborted
            .write()
            .get_or_insert_with(|| format!("{by}: {reason}"));
        if let Some(orchestrator) = self.orchestrator.get() {
            let _ = orchestrator.abort(reason);
        }
    }

    /// Waits for the next envelope and applies it.
    pub async fn recv_and_handle(&self) -> Result<SessionEvent, FairnessError> {
        let envelope = self.transport.recv().await?;
        self.handle(envelope)
    }

    /// Applies everything already queued. Rejected envelopes are logged and skipped.
    pub fn drain(&self) -> Result<Vec<SessionEvent>, FairnessError> {
        let mut events = Vec::new();
        while let Some(envelope) = self.transport.try_recv()? {
            let from = envelope.from.clone();
            let kind = envelope.message.kind();
            match self.handle(envelope) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(target: LOG_TARGET, peer_id = %self.keys.peer_id, from = %from, kind, error = %err, "inbound message rejected")
                }
            }
        }
        Ok(events)
    }

    pub fn handle(&self, envelope: Envelope) -> Result<SessionEvent, FairnessError> {
        let Envelope { from, message } = envelope;
        debug!(target: LOG_TARGET, peer_id = %self.keys.peer_id, from = %from, kind = message.kind(), "handling message");
        match message {
            PeerMessage::Announce(announcement) => self.on_announce(from, announcement),
            PeerMessage::DeckHandoff(deck) => {
                self.orchestrator()?.accept_remote_deck(deck)?;
                Ok(SessionEvent::DeckAccepted {
                    from,
                    complete: self.is_shuffle_complete(),
                })
            }
            PeerMessage::Action(action) => {
                if action.peer_id != from {
                    return Err(invalid(format!(
                        "action {} from {from} is signed as {}",
                        action.id, action.peer_id
                    )));
                }
                self.verifier.verify_and_log_action(&action)?;
                Ok(SessionEvent::ActionAccepted {
                    action_id: action.id,
                    peer_id: from,
                })
            }
            PeerMessage::DecryptionProof(proof) => self.on_proof(from, proof),
            PeerMessage::KeyDisclosure(request) => {
                if request.peer_id != from {
                    return Err(invalid(format!("disclosure from {from} names {}", request.peer_id)));
                }
                let key = self.signing_key(&from)?;
                request.verify(&key.signing_key)?;
                self.disclosures.write().insert(from.clone(), request);
                Ok(SessionEvent::KeyDisclosed { peer_id: from })
            }
            PeerMessage::StateSync(remote) => {
                let local = self.summary();
                let in_sync = local.same_history(&remote);
                let resolution = if in_sync {
                    Resolution::KeepLocal
                } else {
                    self.resolver.resolve(&local, &remote)
                };
                if resolution == Resolution::AdoptRemote {
                    warn!(
                        target: LOG_TARGET,
                        peer_id = %self.keys.peer_id,
                        remote = %from,
                        local_actions = local.action_count,
                        remote_actions = remote.action_count,
                        "remote view is ahead of the local log"
                    );
                }
                Ok(SessionEvent::StateCompared {
                    peer_id: from,
                    in_sync,
                    resolution,
                })
            }
            PeerMessage::Abort { reason } => {
                self.record_abort(&from, &reason);
                Ok(SessionEvent::Aborted { by: from, reason })
            }
        }
    }

    fn on_announce(
        &self,
        from: PeerId,
        announcement: PeerPublicKeys,
    ) -> Result<SessionEvent, FairnessError> {
        if announcement.peer_id != from {
            return Err(invalid(format!("announcement from {from} names {}", announcement.peer_id)));
        }
        if !self.seats.contains(&from) {
            return Err(ShuffleError::UnknownPeer(from).into());
        }
        {
            let mut roster = self.roster.write();
            match roster.get(&from) {
                Some(known) if *known != announcement => {
                    return Err(ShuffleError::DuplicatePeer(from).into());
                }
                Some(_) => {}
                None => {
                    roster.insert(from.clone(), announcement);
                }
            }
        }
        let table_ready = self.try_ready()?;
        Ok(SessionEvent::PeerAnnounced {
            peer_id: from,
            table_ready,
        })
    }

    fn on_proof(&self, from: PeerId, proof: DecryptionProof) -> Result<SessionEvent, FairnessError> {
        if proof.peer_id != from {
            return Err(invalid(format!("proof from {from} names {}", proof.peer_id)));
        }
        let key = self.signing_key(&from)?;
        proof
            .check(&key.signing_key)
            .map_err(|kind| invalid(format!("proof for tile {} failed: {kind:?}", proof.tile_index)))?;
        let expected: Option<EncryptedTile> = match self.current_form(proof.tile_index)? {
            PeeledTile::Layered(tile) => Some(tile),
            PeeledTile::Open(_) => None,
        };
        if expected.as_ref() != Some(&proof.encrypted_tile) {
            return Err(invalid(format!(
                "proof for tile {} does not continue the known layers",
                proof.tile_index
            )));
        }
        let tile_index = proof.tile_index;
        let opened = match &proof.decrypted_tile {
            PeeledTile::Open(tile) => Some(*tile),
            PeeledTile::Layered(_) => None,
        };
        self.reveals
            .write()
            .insert(tile_index, proof.decrypted_tile.clone());
        self.remote_proofs
            .write()
            .entry(from.clone())
            .or_default()
            .insert(tile_index, proof);
        Ok(SessionEvent::ProofAccepted {
            peer_id: from,
            tile_index,
            opened,
        })
    }

    fn signing_key(&self, peer: &str) -> Result<PeerPublicKeys, FairnessError> {
        self.roster
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| ShuffleError::UnknownPeer(peer.to_string()).into())
    }

    /// The record every peer checks after the game: the log, the key
    /// announcements and all decryption proofs seen.
    pub fn verification_data(&self) -> Result<VerificationData, FairnessError> {
        let players = self
            .announcements()
            .ok_or(FairnessError::Shuffle(ShuffleError::NotInitialized))?;
        let now = self.clock.now_millis();
        let mut proofs: BTreeMap<PeerId, ProofExport> = self
            .remote_proofs
            .read()
            .iter()
            .map(|(peer, proofs)| {
                (
                    peer.clone(),
                    ProofExport {
                        proofs: proofs.clone(),
                        timestamp: now,
                    },
                )
            })
            .collect();
        let own = self.proofs.export_proofs();
        if !own.proofs.is_empty() {
            proofs.insert(self.keys.peer_id.clone(), own);
        }
        Ok(VerificationData {
            logs: self.verifier.export_log(),
            players,
            proofs,
        })
    }

    /// Runs the post-game pipeline over this peer's record with every
    /// disclosure received so far.
    pub fn run_post_game(
        &self,
        final_state: FinalGameState,
        judge: Arc<dyn HandJudge>,
    ) -> Result<PostGameState, FairnessError> {
        let deck = self
            .deck()
            .ok_or(FairnessError::Shuffle(ShuffleError::NotInitialized))?;
        let verifier = PostGameVerifier::new(
            self.game_id.clone(),
            &self.config,
            self.clock.clone(),
            self.keys.signing.clone(),
            judge,
        );
        verifier.initialize(self.verification_data()?, final_state, deck)?;
        let disclosures: Vec<KeyDisclosureRequest> =
            self.disclosures.read().values().cloned().collect();
        for request in disclosures {
            verifier.submit_key_disclosure(request)?;
        }
        Ok(verifier.state())
    }
}

fn invalid(message: String) -> FairnessError {
    FairnessError::Verify(VerifyError::InvalidMessage(message))
}
