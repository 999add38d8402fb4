use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::disclosure::KeyDisclosureRequest;
use super::error::PostGameError;
use super::hands::HandReplay;
use super::report::{
    EndCondition, FinalGameState, PostGameExport, VerificationData, VerificationProof,
    VerificationResult, VerificationSummary,
};
use super::state::{PostGameEvent, PostGameState, VerificationPhase};
use crate::clock::SharedClock;
use crate::config::FairnessConfig;
use crate::encryption::{decrypt_tile, peel_layer, PeeledTile};
use crate::game::{ActionPayload, GameAction, HandJudge};
use crate::keys::{EncryptionSecretKey, PeerPublicKeys, SigningKeyPair};
use crate::ledger::types::{GameId, PeerId};
use crate::ledger::{ActionLog, InvalidActionRecord};
use crate::proofs::key_matches;
use crate::shuffling::{verify_deck_history, EncryptedDeck};
use crate::tiles::{check_composition, Tile};

const LOG_TARGET: &str = "legit_mahjong::postgame";
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted { collected: usize, remaining: usize },
    /// The same key was already disclosed; nothing changed.
    AlreadyCollected,
    /// Last key arrived and verification ran to a terminal phase.
    Finished(Box<PostGameState>),
}

struct Inputs {
    data: VerificationData,
    game_state: FinalGameState,
    deck: EncryptedDeck,
    log: ActionLog,
    announced: BTreeMap<PeerId, PeerPublicKeys>,
}

#[derive(Default)]
struct Inner {
    state: PostGameState,
    inputs: Option<Inputs>,
    disclosures: BTreeMap<PeerId, KeyDisclosureRequest>,
}

/// Collects every peer's disclosed encryption key, then re-derives the deck
/// and replays the game to check it.
pub struct PostGameVerifier {
    game_id: GameId,
    config: FairnessConfig,
    clock: SharedClock,
    signer: SigningKeyPair,
    judge: Arc<dyn HandJudge>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<PostGameEvent>,
}

impl PostGameVerifier {
    /// `signer` signs the final verification proof; it is the verifying peer's key.
    pub fn new(
        game_id: impl Into<GameId>,
        config: &FairnessConfig,
        clock: SharedClock,
        signer: SigningKeyPair,
        judge: Arc<dyn HandJudge>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            game_id: game_id.into(),
            config: config.clone(),
            clock,
            signer,
            judge,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PostGameEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PostGameState {
        self.inner.lock().state.clone()
    }

    pub fn phase(&self) -> VerificationPhase {
        self.inner.lock().state.phase
    }

    /// Loads the game record and starts collecting keys. The action log is
    /// re-validated on load.
    pub fn initialize(
        &self,
        data: VerificationData,
        game_state: FinalGameState,
        deck: EncryptedDeck,
    ) -> Result<(), PostGameError> {
        let mut inner = self.inner.lock();
        expect_phase(&inner.state, VerificationPhase::Idle)?;
        if game_state.game_id != self.game_id {
            return Err(PostGameError::GameMismatch {
                expected: self.game_id.clone(),
                actual: game_state.game_id,
            });
        }
        let announced: BTreeMap<PeerId, PeerPublicKeys> = data
            .players
            .iter()
            .map(|peer| (peer.peer_id.clone(), peer.clone()))
            .collect();
        if let Some(missing) = game_state
            .players
            .iter()
            .find(|peer| !announced.contains_key(*peer))
        {
            return Err(PostGameError::UnknownPeer(missing.clone()));
        }
        let log = ActionLog::import(data.logs.clone())?;

        inner.inputs = Some(Inputs {
            data,
            game_state,
            deck,
            log,
            announced,
        });
        self.transition(
            &mut inner.state,
            VerificationPhase::CollectingKeys,
            "Waiting for players to disclose keys",
        );
        Ok(())
    }

    /// Accepts one peer's key. The last key triggers verification, which runs
    /// to completion before this returns.
    #[instrument(skip(self, request), fields(peer_id = %request.peer_id), level = "trace")]
    pub fn submit_key_disclosure(
        &self,
        request: KeyDisclosureRequest,
    ) -> Result<SubmitOutcome, PostGameError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(existing) = inner.disclosures.get(&request.peer_id) {
            if existing.discloses_same_key(&request) {
                debug!(target: LOG_TARGET, peer_id = %request.peer_id, "duplicate key disclosure ignored");
                return Ok(SubmitOutcome::AlreadyCollected);
            }
        }
        expect_phase(&inner.state, VerificationPhase::CollectingKeys)?;
        let Some(inputs) = inner.inputs.as_ref() else {
            return Err(PostGameError::WrongPhase {
                expected: VerificationPhase::CollectingKeys,
                actual: inner.state.phase,
            });
        };
        if let Err(err) = self.check_disclosure(inputs, &inner.disclosures, &request) {
            warn!(
                target: LOG_TARGET,
                peer_id = %request.peer_id,
                error = %err,
                "key disclosure rejected"
            );
            return Err(err);
        }

        let peer_id = request.peer_id.clone();
        inner.disclosures.insert(peer_id.clone(), request);
        inner.state.collected_keys = inner.disclosures.keys().cloned().collect();
        let _ = self.events.send(PostGameEvent::KeyReceived {
            peer_id: peer_id.clone(),
        });

        let total = inputs.game_state.players.len();
        let collected = inner.disclosures.len();
        info!(target: LOG_TARGET, peer_id = %peer_id, collected, total, "key disclosure accepted");
        self.progress(
            &mut inner.state,
            (collected * 30 / total.max(1)) as u8,
            format!("Collected keys from {collected}/{total} players"),
        );
        if collected < total {
            return Ok(SubmitOutcome::Accepted {
                collected,
                remaining: total - collected,
            });
        }

        self.transition(
            &mut inner.state,
            VerificationPhase::Verifying,
            "Starting verification process",
        );
        self.progress(&mut inner.state, 30, "Starting verification process".into());
        match self.run_verification(&mut inner.state, inputs, &inner.disclosures) {
            Ok(result) => self.finish(&mut inner.state, result),
            Err(err) => self.fail(&mut inner.state, err.to_string(), None),
        }
        Ok(SubmitOutcome::Finished(Box::new(inner.state.clone())))
    }

    /// Explicit abort from any non-terminal phase, e.g. when a peer never
    /// discloses its key.
    pub fn abort(&self, reason: impl Into<String>) -> Result<(), PostGameError> {
        let mut inner = self.inner.lock();
        if inner.state.phase.is_terminal() {
            return Err(PostGameError::WrongPhase {
                expected: VerificationPhase::CollectingKeys,
                actual: inner.state.phase,
            });
        }
        let reason = reason.into();
        self.fail(
            &mut inner.state,
            PostGameError::Aborted(reason).to_string(),
            None,
        );
        Ok(())
    }

    pub fn export_verification_data(&self) -> Result<PostGameExport, PostGameError> {
        let inner = self.inner.lock();
        match (&inner.state.verification_result, &inner.inputs) {
            (Some(result), Some(inputs)) => Ok(PostGameExport {
                game_id: self.game_id.clone(),
                timestamp: self.clock.now_millis(),
                verification_result: result.clone(),
                verification_data: inputs.data.clone(),
                game_state: inputs.game_state.clone(),
            }),
            _ => Err(PostGameError::WrongPhase {
                expected: VerificationPhase::Completed,
                actual: inner.state.phase,
            }),
        }
    }

    fn check_disclosure(
        &self,
        inputs: &Inputs,
        collected: &BTreeMap<PeerId, KeyDisclosureRequest>,
        request: &KeyDisclosureRequest,
    ) -> Result<(), PostGameError> {
        if request.game_id != self.game_id {
            return Err(PostGameError::GameMismatch {
                expected: self.game_id.clone(),
                actual: request.game_id.clone(),
            });
        }
        if !inputs.game_state.players.contains(&request.peer_id) {
            return Err(PostGameError::UnknownPeer(request.peer_id.clone()));
        }
        let Some(announced) = inputs.announced.get(&request.peer_id) else {
            return Err(PostGameError::UnknownPeer(request.peer_id.clone()));
        };
        request
            .verify(&announced.signing_key)
            .map_err(|_| PostGameError::BadDisclosureSignature(request.peer_id.clone()))?;
        if collected.contains_key(&request.peer_id) {
            return Err(PostGameError::ConflictingDisclosure(request.peer_id.clone()));
        }
        if request.public_key != announced.encryption_key
            || !request.private_key.matches(&announced.encryption_key)
        {
            return Err(PostGameError::KeyMismatch(request.peer_id.clone()));
        }
        Ok(())
    }

    fn run_verification(
        &self,
        state: &mut PostGameState,
        inputs: &Inputs,
        disclosures: &BTreeMap<PeerId, KeyDisclosureRequest>,
    ) -> Result<VerificationResult, PostGameError> {
        self.progress(state, 40, "Decrypting initial tile deck".into());
        let decrypted = decrypt_deck(inputs, disclosures, &self.config)?;

        self.progress(state, 50, "Verifying initial deck composition".into());
        let mut errors = Vec::new();
        let deck_valid = match check_composition(&decrypted, self.config.copies_per_kind) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: LOG_TARGET, error = %err, "deck composition check failed");
                errors.push(err.to_string());
                false
            }
        };

        self.progress(state, 60, "Reconstructing player hand histories".into());
        let actions = decode_actions(&inputs.log);
        let mut reasons: Vec<Option<String>> = vec![None; inputs.log.len()];
        let seats = &inputs.game_state.players;
        let (histories, replay_winner) = match HandReplay::deal(&decrypted, seats, self.judge.as_ref())
        {
            Ok(mut replay) => {
                for (index, action) in actions.iter().enumerate() {
                    let Ok(action) = action else { continue };
                    let Ok(payload) = action.payload() else { continue };
                    if let Err(err) = replay.apply(&action.peer_id, &payload) {
                        reasons[index].get_or_insert_with(|| err.to_string());
                    }
                }
                let winner = replay.winner().cloned();
                (replay.into_histories(), winner)
            }
            Err(err) => {
                errors.push(format!("cannot deal opening hands: {err}"));
                (BTreeMap::new(), None)
            }
        };

        self.progress(state, 80, "Verifying all game actions".into());
        self.check_actions(inputs, &actions, &mut reasons, &mut errors);
        let invalid_actions: Vec<InvalidActionRecord> = reasons
            .iter()
            .enumerate()
            .filter_map(|(index, reason)| {
                let reason = reason.clone()?;
                let entry = &inputs.log.entries()[index];
                let (action_id, peer_id, timestamp) = match &actions[index] {
                    Ok(action) => (action.id.clone(), action.peer_id.clone(), action.timestamp),
                    Err(_) => (entry.id.clone(), String::new(), entry.timestamp),
                };
                Some(InvalidActionRecord {
                    action_id,
                    peer_id,
                    reason,
                    timestamp,
                })
            })
            .collect();
        let participation = participation_errors(seats, &actions);
        let actions_valid = invalid_actions.is_empty() && participation.is_empty();
        errors.extend(participation);

        let proof_errors = self.check_proofs(inputs, disclosures, &decrypted);
        let proofs_valid = proof_errors.is_empty();
        errors.extend(proof_errors);

        self.progress(state, 90, "Verifying final game state".into());
        let state_errors = self.check_final_state(inputs, replay_winner.as_ref());
        let final_state_valid = state_errors.is_empty();
        errors.extend(state_errors);

        self.progress(state, 95, "Generating verification proof".into());
        let summary = VerificationSummary {
            game_id: self.game_id.clone(),
            timestamp: self.clock.now_millis(),
            deck_valid,
            actions_valid,
            final_state_valid,
            invalid_action_count: invalid_actions.len(),
        };
        Ok(VerificationResult {
            success: deck_valid && actions_valid && proofs_valid && final_state_valid,
            initial_deck_valid: deck_valid,
            actions_valid,
            proofs_valid,
            final_state_valid,
            invalid_actions,
            errors,
            player_hand_histories: histories,
            full_deck_decrypted: decrypted,
            verification_proof: VerificationProof::sign(summary, &self.signer),
        })
    }

    /// Signatures, chain links and ordering rules.
    fn check_actions(
        &self,
        inputs: &Inputs,
        actions: &[Result<GameAction, String>],
        reasons: &mut [Option<String>],
        errors: &mut Vec<String>,
    ) {
        let chain = inputs.log.verify_chain();
        for (index, message) in chain.breaks.iter().map(|b| b.index).zip(chain.messages()) {
            errors.push(message.clone());
            reasons[index].get_or_insert(message);
        }

        let mut started = false;
        let mut ended = false;
        for (index, action) in actions.iter().enumerate() {
            let action = match action {
                Ok(action) => action,
                Err(reason) => {
                    reasons[index].get_or_insert_with(|| reason.clone());
                    continue;
                }
            };
            let entry = &inputs.log.entries()[index];
            let signature = match inputs.announced.get(&action.peer_id) {
                None => Some(format!("peer {} is not registered", action.peer_id)),
                Some(peer) if peer.signing_key != entry.public_key => {
                    Some("logged key differs from the announced signing key".to_string())
                }
                Some(peer) => action
                    .verify_signature(&peer.signing_key)
                    .err()
                    .map(|err| err.to_string()),
            };
            let sequence = match action.payload() {
                Err(err) => Some(format!(
                    "malformed {} payload: {err}",
                    action.action_type.as_str()
                )),
                Ok(ActionPayload::GameStart(data)) => {
                    let reason = if started {
                        Some("Multiple game start actions detected".to_string())
                    } else if index != 0 {
                        Some("game start is not the first action".to_string())
                    } else if data.players != inputs.game_state.players {
                        Some("game start seats differ from the final state".to_string())
                    } else {
                        None
                    };
                    started = true;
                    reason
                }
                Ok(_) if !started => Some(format!(
                    "Action {} before game start",
                    action.action_type.as_str()
                )),
                Ok(_) if ended => Some("Actions after game end".to_string()),
                Ok(ActionPayload::Win(_)) => {
                    ended = true;
                    None
                }
                Ok(_) => None,
            };
            if let Some(reason) = signature.or(sequence) {
                reasons[index].get_or_insert(reason);
            }
        }
        if !started && !actions.is_empty() {
            errors.push("log has no game start".to_string());
        }
    }

    fn check_proofs(
        &self,
        inputs: &Inputs,
        disclosures: &BTreeMap<PeerId, KeyDisclosureRequest>,
        decrypted: &[Tile],
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for (peer_id, export) in &inputs.data.proofs {
            let (Some(peer), Some(disclosure)) =
                (inputs.announced.get(peer_id), disclosures.get(peer_id))
            else {
                errors.push(format!("No public key for proofs of {peer_id}"));
                continue;
            };
            let keys = export
                .proofs
                .keys()
                .map(|index| (*index, peer.signing_key))
                .collect();
            errors.extend(export.verify_all(&keys).iter().map(|f| f.to_string()));
            for (index, proof) in &export.proofs {
                if proof.peer_id != *peer_id {
                    errors.push(format!("Proof for tile {index} names {}", proof.peer_id));
                }
                if !key_matches(proof, &disclosure.private_key) {
                    errors.push(format!(
                        "Proof for tile {index} does not commit to {peer_id}'s disclosed key"
                    ));
                }
                match peel_layer(&proof.encrypted_tile, &disclosure.private_key) {
                    Ok(peeled) if peeled == proof.decrypted_tile => {}
                    Ok(_) => errors.push(format!(
                        "Proof for tile {index} by {peer_id}: decrypted output does not match"
                    )),
                    Err(err) => errors.push(format!(
                        "Proof for tile {index} by {peer_id}: disclosed key cannot peel it ({err})"
                    )),
                }
                if let Some(dealt) = inputs.deck.tile(*index as usize) {
                    if proof.encrypted_tile.layer_count() == dealt.layer_count()
                        && proof.encrypted_tile != *dealt
                    {
                        errors.push(format!(
                            "Proof for tile {index} by {peer_id}: input differs from the deck"
                        ));
                    }
                }
                if let PeeledTile::Open(tile) = &proof.decrypted_tile {
                    if decrypted.get(*index as usize) != Some(tile) {
                        errors.push(format!("Proof for tile {index} claims {tile}"));
                    }
                }
            }
        }
        for error in &errors {
            warn!(target: LOG_TARGET, error = %error, "decryption proof check failed");
        }
        errors
    }

    fn check_final_state(&self, inputs: &Inputs, replay_winner: Option<&PeerId>) -> Vec<String> {
        let state = &inputs.game_state;
        let mut errors = Vec::new();
        let seated: Vec<&PeerId> = inputs.data.players.iter().map(|p| &p.peer_id).collect();
        if state.players.iter().collect::<Vec<_>>() != seated {
            errors.push("final state seats differ from the key announcements".to_string());
        }
        for player in &state.players {
            if !state.final_scores.contains_key(player) {
                errors.push(format!("No final score for player {player}"));
            }
        }
        let total: i64 = state.final_scores.values().sum();
        let expected = self.config.expected_score_total(state.players.len());
        if total != expected {
            errors.push(format!(
                "Total scores ({total}) don't match expected ({expected})"
            ));
        }
        match (&state.winner, state.end_condition) {
            (None, EndCondition::Win) => errors.push("Game ended without a winner".to_string()),
            (Some(winner), _) if !state.players.contains(winner) => {
                errors.push(format!("winner {winner} is not seated"))
            }
            _ => {}
        }
        match (replay_winner, &state.winner) {
            (Some(author), declared) if declared.as_ref() != Some(author) => errors.push(format!(
                "WIN action by {author} but declared winner is {}",
                declared.as_deref().unwrap_or("nobody")
            )),
            (None, Some(declared)) if state.end_condition == EndCondition::Win => {
                errors.push(format!("no valid WIN action by declared winner {declared}"))
            }
            _ => {}
        }
        for error in &errors {
            warn!(target: LOG_TARGET, error = %error, "final state check failed");
        }
        errors
    }

    fn finish(&self, state: &mut PostGameState, result: VerificationResult) {
        if result.initial_deck_valid && result.final_state_valid {
            info!(
                target: LOG_TARGET,
                game_id = %self.game_id,
                success = result.success,
                invalid_actions = result.invalid_actions.len(),
                "post-game verification complete"
            );
            state.progress = 100;
            state.current_step = "Verification complete".into();
            state.verification_result = Some(result.clone());
            self.transition(state, VerificationPhase::Completed, "Verification complete");
            let _ = self.events.send(PostGameEvent::Completed(Box::new(result)));
        } else {
            let error = result
                .errors
                .first()
                .cloned()
                .unwrap_or_else(|| "verification failed".to_string());
            self.fail(state, error, Some(result));
        }
    }

    fn fail(&self, state: &mut PostGameState, error: String, result: Option<VerificationResult>) {
        warn!(target: LOG_TARGET, game_id = %self.game_id, error = %error, "post-game verification failed");
        state.verification_result = result;
        state.error = Some(error.clone());
        self.transition(state, VerificationPhase::Failed, "Verification failed");
        let _ = self.events.send(PostGameEvent::Failed { error });
    }

    fn transition(&self, state: &mut PostGameState, next: VerificationPhase, step: &str) {
        if !state.phase.can_advance_to(next) {
            warn!(target: LOG_TARGET, from = ?state.phase, to = ?next, "ignored backward phase change");
            return;
        }
        info!(target: LOG_TARGET, game_id = %self.game_id, from = ?state.phase, to = ?next, "phase changed");
        state.phase = next;
        state.current_step = step.to_string();
        let _ = self.events.send(PostGameEvent::StateChanged(next));
    }

    fn progress(&self, state: &mut PostGameState, progress: u8, step: String) {
        debug!(target: LOG_TARGET, progress, step = %step, "verification progress");
        state.progress = progress;
        state.current_step = step.clone();
        let _ = self.events.send(PostGameEvent::Progress { progress, step });
    }
}

fn expect_phase(state: &PostGameState, expected: VerificationPhase) -> Result<(), PostGameError> {
    if state.phase == expected {
        Ok(())
    } else {
        Err(PostGameError::WrongPhase {
            expected,
            actual: state.phase,
        })
    }
}

/// Checks the deck's shuffle history, then opens every tile with the disclosed
/// keys, last encrypting peer first.
fn decrypt_deck(
    inputs: &Inputs,
    disclosures: &BTreeMap<PeerId, KeyDisclosureRequest>,
    config: &FairnessConfig,
) -> Result<Vec<Tile>, PostGameError> {
    verify_deck_history(&inputs.deck, &inputs.data.players, config)?;
    let secrets = inputs
        .deck
        .encryption_order
        .iter()
        .rev()
        .map(|peer| {
            disclosures
                .get(peer)
                .map(|request| &request.private_key)
                .ok_or_else(|| PostGameError::UnknownPeer(peer.clone()))
        })
        .collect::<Result<Vec<&EncryptionSecretKey>, _>>()?;
    let tiles = inputs
        .deck
        .tiles
        .iter()
        .map(|tile| decrypt_tile(tile, &secrets))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tiles)
}

fn decode_actions(log: &ActionLog) -> Vec<Result<GameAction, String>> {
    log.entries()
        .iter()
        .map(|entry| {
            entry
                .decode_action()
                .map_err(|err| format!("undecodable log entry: {err}"))
        })
        .collect()
}

fn participation_errors(seats: &[PeerId], actions: &[Result<GameAction, String>]) -> Vec<String> {
    let acted: BTreeSet<&str> = actions
        .iter()
        .filter_map(|action| action.as_ref().ok())
        .map(|action| action.peer_id.as_str())
        .collect();
    seats
        .iter()
        .filter(|seat| !acted.contains(seat.as_str()))
        .map(|seat| format!("Player {seat} never acted"))
        .collect()
}
