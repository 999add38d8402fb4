use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::encryption::{decrypt_tile, encrypt_tile, peel_layer, EncryptedTile, PeeledTile};
use crate::game::{
    ActionPayload, DiscardData, DrawData, GameAction, GameStartData, StructuralJudge, WinData,
    WinType,
};
use crate::keys::{EncryptionKeyPair, EncryptionSecretKey, PeerKeys};
use crate::ledger::types::PeerId;
use crate::ledger::VerificationManager;
use crate::proofs::{DecryptionProofService, ProofExport};
use crate::shuffling::{EncryptedDeck, ShuffleOrchestrator, ShuffleRecord};
use crate::signing::Signable;
use crate::test_utils::fixtures::{TestTable, START_MILLIS};
use crate::tiles::{check_composition, full_tile_set, Tile};

const GAME_ID: &str = "table-7";
/// First position left in the wall after dealing four seats.
const WALL_START: u32 = 53;

struct PlayedGame {
    table: TestTable,
    deck: EncryptedDeck,
    opened: Vec<Tile>,
}

impl PlayedGame {
    /// Runs the real shuffle over `tiles`.
    fn shuffled(seed: u64, tiles: Vec<Tile>) -> Self {
        let table = TestTable::new(4, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let orch =
            ShuffleOrchestrator::new(table.announcements(), &table.config, table.clock.clone())
                .unwrap();
        orch.initialize_deck(&mut rng, tiles, &table.peers[0]).unwrap();
        for seat in 1..4 {
            orch.perform_current_player_shuffle(&mut rng, &table.peers[seat])
                .unwrap();
        }
        Self::from_deck(table, orch.deck().unwrap())
    }

    /// Seals `tiles` in the given order with identity shuffle passes, so a test
    /// controls what each seat is dealt.
    fn arranged(seed: u64, tiles: Vec<Tile>) -> Self {
        let table = TestTable::new(4, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let keys: Vec<_> = table.peers.iter().map(|p| p.encryption.public_key()).collect();
        let sealed: Vec<EncryptedTile> = tiles
            .iter()
            .map(|tile| encrypt_tile(&mut rng, *tile, &keys).unwrap())
            .collect();
        let identity: Vec<u32> = (0..tiles.len() as u32).collect();
        let history = table
            .peers
            .iter()
            .enumerate()
            .map(|(i, peer)| {
                ShuffleRecord::signed(
                    peer.peer_id.clone(),
                    START_MILLIS + i as i64,
                    identity.clone(),
                    &peer.signing,
                )
            })
            .collect();
        let deck = EncryptedDeck {
            tiles: sealed,
            shuffle_history: history,
            encryption_order: table.seat_ids(),
        };
        Self::from_deck(table, deck)
    }

    fn from_deck(table: TestTable, deck: EncryptedDeck) -> Self {
        let secrets: Vec<&EncryptionSecretKey> =
            table.peers.iter().rev().map(|p| p.encryption.secret()).collect();
        let opened = deck
            .tiles
            .iter()
            .map(|tile| decrypt_tile(tile, &secrets).unwrap())
            .collect();
        Self {
            table,
            deck,
            opened,
        }
    }

    fn start(&self) -> GameAction {
        self.table.sign(
            0,
            &ActionPayload::GameStart(GameStartData {
                players: self.table.seat_ids(),
                seed: None,
            }),
        )
    }

    /// South, west, north and east each draw one wall tile and discard it.
    fn draw_discard_round(&self) -> Vec<GameAction> {
        self.round_discarding(|_, tile| tile)
    }

    /// Same round, but each discard names `claim(position, real_tile)`.
    fn round_discarding(&self, claim: impl Fn(u32, Tile) -> Tile) -> Vec<GameAction> {
        let mut actions = vec![self.start()];
        for (offset, seat) in [1usize, 2, 3, 0].into_iter().enumerate() {
            let position = WALL_START + offset as u32;
            actions.push(self.table.sign(
                seat,
                &ActionPayload::Draw(DrawData {
                    tile_index: position,
                }),
            ));
            actions.push(self.table.sign(
                seat,
                &ActionPayload::Discard(DiscardData {
                    tile_index: position,
                    tile: claim(position, self.opened[position as usize]),
                }),
            ));
        }
        actions
    }

    /// Peels `tile_index` layer by layer, outermost owner first, each peer
    /// proving its step.
    fn proofs_for(&self, tile_index: u32) -> BTreeMap<PeerId, ProofExport> {
        let mut current = self.deck.tiles[tile_index as usize].clone();
        let mut exports = BTreeMap::new();
        for peer in self.table.peers.iter().rev() {
            let service = DecryptionProofService::new(
                peer.peer_id.clone(),
                peer.signing.clone(),
                self.table.clock.clone(),
            );
            let (peeled, _) = service
                .peel_and_prove(tile_index, &current, peer.encryption.secret())
                .unwrap();
            if let PeeledTile::Layered(next) = peeled {
                current = next;
            }
            exports.insert(peer.peer_id.clone(), service.export_proofs());
        }
        exports
    }

    fn verification_data(
        &self,
        actions: &[GameAction],
        proofs: BTreeMap<PeerId, ProofExport>,
    ) -> VerificationData {
        let manager = VerificationManager::new(GAME_ID, &self.table.config, self.table.clock.clone());
        manager.register_peers(self.table.announcements().iter());
        let report = manager.verify_action_sequence(actions.iter());
        assert!(report.valid, "{:?}", report.errors);
        VerificationData {
            logs: manager.export_log(),
            players: self.table.announcements(),
            proofs,
        }
    }

    fn exhaustive_state(&self, scores: [i64; 4]) -> FinalGameState {
        FinalGameState {
            game_id: GAME_ID.into(),
            players: self.table.seat_ids(),
            final_scores: self.table.seat_ids().into_iter().zip(scores).collect(),
            winner: None,
            end_condition: EndCondition::Exhaustive,
        }
    }

    fn verifier(&self) -> PostGameVerifier {
        PostGameVerifier::new(
            GAME_ID,
            &self.table.config,
            self.table.clock.clone(),
            self.table.peers[0].signing.clone(),
            Arc::new(StructuralJudge),
        )
    }

    fn disclosure(&self, seat: usize) -> KeyDisclosureRequest {
        KeyDisclosureRequest::new(GAME_ID, &self.table.peers[seat], 1_700_000_100_000)
    }

    fn disclose_all(&self, verifier: &PostGameVerifier) -> SubmitOutcome {
        let mut last = None;
        for seat in 0..4 {
            last = Some(verifier.submit_key_disclosure(self.disclosure(seat)).unwrap());
        }
        last.unwrap()
    }
}

fn finished(outcome: SubmitOutcome) -> PostGameState {
    match outcome {
        SubmitOutcome::Finished(state) => *state,
        other => panic!("expected finished verification, got {other:?}"),
    }
}

#[test]
fn phase_waits_for_last_key_then_completes() {
    let game = PlayedGame::shuffled(81, full_tile_set(4));
    let actions = game.draw_discard_round();
    let data = game.verification_data(&actions, game.proofs_for(WALL_START));
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();
    assert_eq!(verifier.phase(), VerificationPhase::CollectingKeys);

    for seat in 0..3 {
        let outcome = verifier.submit_key_disclosure(game.disclosure(seat)).unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Accepted {
                collected: seat + 1,
                remaining: 3 - seat
            }
        );
        assert_eq!(verifier.phase(), VerificationPhase::CollectingKeys);
    }
    assert_eq!(verifier.state().progress, 22);

    let state = finished(verifier.submit_key_disclosure(game.disclosure(3)).unwrap());
    assert_eq!(state.phase, VerificationPhase::Completed);
    assert_eq!(state.progress, 100);
    let result = state.verification_result.unwrap();
    assert!(result.success, "{:?} {:?}", result.errors, result.invalid_actions);
    assert!(result.initial_deck_valid && result.actions_valid);
    assert!(result.proofs_valid && result.final_state_valid);
    assert!(check_composition(&result.full_deck_decrypted, 4).is_ok());
    assert_eq!(result.full_deck_decrypted, game.opened);
    assert_eq!(result.player_hand_histories.len(), 4);
    assert_eq!(result.player_hand_histories["south"].snapshots.len(), 3);
    assert!(result.verification_proof.verify());
    assert_eq!(
        result.verification_proof.signer,
        game.table.signing_public(0)
    );
}

#[test]
fn duplicate_disclosure_is_a_no_op() {
    let game = PlayedGame::shuffled(82, full_tile_set(4));
    let data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    verifier.submit_key_disclosure(game.disclosure(2)).unwrap();
    let resent = KeyDisclosureRequest::new(GAME_ID, &game.table.peers[2], 1_700_000_200_000);
    assert_eq!(
        verifier.submit_key_disclosure(resent).unwrap(),
        SubmitOutcome::AlreadyCollected
    );
    assert_eq!(verifier.state().collected_keys, vec!["west".to_string()]);
    assert_eq!(verifier.state().progress, 7);

    // Still a no-op after verification has finished.
    game.disclose_all(&verifier);
    assert_eq!(
        verifier.submit_key_disclosure(game.disclosure(2)).unwrap(),
        SubmitOutcome::AlreadyCollected
    );
}

#[test]
fn disclosures_are_authenticated() {
    let game = PlayedGame::shuffled(83, full_tile_set(4));
    let data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    let verifier = game.verifier();
    assert!(matches!(
        verifier.submit_key_disclosure(game.disclosure(0)),
        Err(PostGameError::WrongPhase {
            expected: VerificationPhase::CollectingKeys,
            actual: VerificationPhase::Idle
        })
    ));
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    let other_game = KeyDisclosureRequest::new("table-8", &game.table.peers[0], 1);
    assert!(matches!(
        verifier.submit_key_disclosure(other_game),
        Err(PostGameError::GameMismatch { .. })
    ));

    let mut rng = StdRng::seed_from_u64(830);
    let impostor = PeerKeys::generate("east", &mut rng);
    assert_eq!(
        verifier.submit_key_disclosure(KeyDisclosureRequest::new(GAME_ID, &impostor, 1)),
        Err(PostGameError::BadDisclosureSignature("east".into()))
    );

    let ghost = PeerKeys::generate("ghost", &mut rng);
    assert_eq!(
        verifier.submit_key_disclosure(KeyDisclosureRequest::new(GAME_ID, &ghost, 1)),
        Err(PostGameError::UnknownPeer("ghost".into()))
    );

    // Correctly signed by south, but the secret is not south's announced key.
    let wrong_secret = EncryptionKeyPair::generate(&mut rng);
    let mut swapped = game.disclosure(1);
    swapped.private_key = wrong_secret.secret().clone();
    swapped.signature = swapped.sign_with(&game.table.peers[1].signing);
    assert_eq!(
        verifier.submit_key_disclosure(swapped.clone()),
        Err(PostGameError::KeyMismatch("south".into()))
    );

    verifier.submit_key_disclosure(game.disclosure(1)).unwrap();
    assert_eq!(
        verifier.submit_key_disclosure(swapped),
        Err(PostGameError::ConflictingDisclosure("south".into()))
    );
    assert_eq!(verifier.state().collected_keys.len(), 1);
}

#[test]
fn wrong_score_total_fails_but_keeps_result() {
    let game = PlayedGame::shuffled(84, full_tile_set(4));
    let data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    let verifier = game.verifier();
    verifier
        .initialize(
            data,
            game.exhaustive_state([25_000, 25_000, 25_000, 24_000]),
            game.deck.clone(),
        )
        .unwrap();

    let state = finished(game.disclose_all(&verifier));
    assert_eq!(state.phase, VerificationPhase::Failed);
    let error = state.error.unwrap();
    assert!(error.contains("Total scores (99000)"), "{error}");
    let result = state.verification_result.unwrap();
    assert!(!result.final_state_valid);
    assert!(result.initial_deck_valid);
    assert!(!result.success);
}

#[test]
fn lying_discard_is_attributed_to_its_action() {
    let game = PlayedGame::shuffled(85, full_tile_set(4));
    // North draws the third wall tile and names a different one on discard.
    let lied_about = WALL_START + 2;
    let actions = game.round_discarding(|position, real| {
        if position == lied_about {
            Tile::all().find(|kind| *kind != real).unwrap()
        } else {
            real
        }
    });
    let lying_id = actions[6].id.clone();
    let data = game.verification_data(&actions, BTreeMap::new());
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    let state = finished(game.disclose_all(&verifier));
    assert_eq!(state.phase, VerificationPhase::Completed);
    let result = state.verification_result.unwrap();
    assert!(!result.success);
    assert!(!result.actions_valid);
    assert_eq!(result.invalid_actions.len(), 1);
    assert_eq!(result.invalid_actions[0].action_id, lying_id);
    assert_eq!(result.invalid_actions[0].peer_id, "north");
    assert!(result.invalid_actions[0].reason.contains("action claims"));
    assert_eq!(result.verification_proof.summary.invalid_action_count, 1);
}

#[test]
fn miscounted_deck_fails_composition() {
    let mut tiles = full_tile_set(4);
    tiles[0] = "2m".parse().unwrap();
    let game = PlayedGame::shuffled(86, tiles);
    let data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    let state = finished(game.disclose_all(&verifier));
    assert_eq!(state.phase, VerificationPhase::Failed);
    let result = state.verification_result.unwrap();
    assert!(!result.initial_deck_valid);
    assert!(
        result.errors[0].contains("2 kinds miscounted"),
        "{:?}",
        result.errors
    );
}

#[test]
fn tampered_proof_is_reported() {
    let game = PlayedGame::shuffled(87, full_tile_set(4));
    let mut proofs = game.proofs_for(WALL_START);
    if let Some(export) = proofs.get_mut("west") {
        if let Some(proof) = export.proofs.get_mut(&WALL_START) {
            proof.timestamp += 1;
        }
    }
    let data = game.verification_data(&game.draw_discard_round(), proofs);
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    let state = finished(game.disclose_all(&verifier));
    assert_eq!(state.phase, VerificationPhase::Completed);
    let result = state.verification_result.unwrap();
    assert!(!result.proofs_valid);
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| e == &format!("Invalid proof for tile {WALL_START} (DigestMismatch)")));
}

/// North signs a commitment to an inner layer it never produced.
fn forged_outer_proof(game: &PlayedGame, tile_index: u32, input: EncryptedTile) -> ProofExport {
    let north = &game.table.peers[3];
    let service = DecryptionProofService::new(
        north.peer_id.clone(),
        north.signing.clone(),
        game.table.clock.clone(),
    );
    let mut output = match peel_layer(&input, north.encryption.secret()).unwrap() {
        PeeledTile::Layered(inner) => inner,
        PeeledTile::Open(_) => panic!("outer layer should not open the tile"),
    };
    if let Some(layer) = output.encrypted_data.last_mut() {
        layer.ciphertext[0] ^= 0x01;
    }
    service.generate_proof(
        tile_index,
        input,
        PeeledTile::Layered(output),
        north.encryption.secret(),
    );
    service.export_proofs()
}

#[test]
fn forged_intermediate_layer_is_attributed() {
    let game = PlayedGame::shuffled(89, full_tile_set(4));
    let mut proofs = game.proofs_for(WALL_START);
    let dealt = game.deck.tiles[WALL_START as usize].clone();
    proofs.insert("north".into(), forged_outer_proof(&game, WALL_START, dealt));

    let data = game.verification_data(&game.draw_discard_round(), proofs);
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    let result = finished(game.disclose_all(&verifier))
        .verification_result
        .unwrap();
    assert!(!result.proofs_valid);
    assert!(!result.success);
    assert!(result.errors.contains(&format!(
        "Proof for tile {WALL_START} by north: decrypted output does not match"
    )));
}

#[test]
fn outer_proof_must_start_from_the_deck_tile() {
    let game = PlayedGame::shuffled(90, full_tile_set(4));
    let mut proofs = game.proofs_for(WALL_START);
    // Honest peel of a different position, filed under WALL_START.
    let elsewhere = game.deck.tiles[WALL_START as usize + 1].clone();
    let north = &game.table.peers[3];
    let service = DecryptionProofService::new(
        north.peer_id.clone(),
        north.signing.clone(),
        game.table.clock.clone(),
    );
    service
        .peel_and_prove(WALL_START, &elsewhere, north.encryption.secret())
        .unwrap();
    proofs.insert("north".into(), service.export_proofs());

    let data = game.verification_data(&game.draw_discard_round(), proofs);
    let verifier = game.verifier();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();

    let result = finished(game.disclose_all(&verifier))
        .verification_result
        .unwrap();
    assert!(!result.proofs_valid);
    assert!(result.errors.contains(&format!(
        "Proof for tile {WALL_START} by north: input differs from the deck"
    )));
}

#[test]
fn tsumo_win_by_declared_winner() {
    let winning: Vec<Tile> = "1m 2m 3m 4p 5p 6p 7s 8s 9s E E E N N"
        .split_whitespace()
        .map(|c| c.parse().unwrap())
        .collect();
    let mut rest = full_tile_set(4);
    for tile in &winning {
        let at = rest.iter().position(|t| t == tile).unwrap();
        rest.remove(at);
    }
    let mut tiles = winning.clone();
    tiles.extend(rest);
    let game = PlayedGame::arranged(88, tiles);

    let mut actions = game.draw_discard_round();
    actions.truncate(7);
    actions.push(game.table.sign(
        0,
        &ActionPayload::Win(WinData {
            win_type: WinType::Tsumo,
            target_peer_id: None,
            hand_tiles: winning.clone(),
            win_tile: "9s".parse().unwrap(),
            win_tile_index: None,
            score: 7_000,
        }),
    ));
    let data = game.verification_data(&actions, BTreeMap::new());
    let mut state = game.exhaustive_state([32_000, 25_000, 25_000, 18_000]);
    state.winner = Some("east".into());
    state.end_condition = EndCondition::Win;

    let verifier = game.verifier();
    verifier.initialize(data, state, game.deck.clone()).unwrap();
    let done = finished(game.disclose_all(&verifier));
    let result = done.verification_result.unwrap();
    assert!(result.success, "{:?} {:?}", result.errors, result.invalid_actions);

    // Same game, but the record names south as winner.
    let data = game.verification_data(&actions, BTreeMap::new());
    let mut state = game.exhaustive_state([25_000, 32_000, 25_000, 18_000]);
    state.winner = Some("south".into());
    state.end_condition = EndCondition::Win;
    let verifier = game.verifier();
    verifier.initialize(data, state, game.deck.clone()).unwrap();
    let done = finished(game.disclose_all(&verifier));
    assert_eq!(done.phase, VerificationPhase::Failed);
    assert!(done.error.unwrap().contains("WIN action by east"));
}

#[test]
fn abort_moves_to_failed_and_is_terminal() {
    let game = PlayedGame::shuffled(89, full_tile_set(4));
    let data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    let verifier = game.verifier();
    let mut events = verifier.subscribe();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();
    verifier.submit_key_disclosure(game.disclosure(0)).unwrap();

    verifier.abort("north never disclosed").unwrap();
    let state = verifier.state();
    assert_eq!(state.phase, VerificationPhase::Failed);
    assert!(state.error.unwrap().contains("north never disclosed"));
    assert!(verifier.abort("again").is_err());
    assert!(matches!(
        verifier.submit_key_disclosure(game.disclosure(3)),
        Err(PostGameError::WrongPhase { .. })
    ));
    assert!(verifier.export_verification_data().is_err());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen.first(),
        Some(&PostGameEvent::StateChanged(VerificationPhase::CollectingKeys))
    );
    assert!(seen.contains(&PostGameEvent::KeyReceived {
        peer_id: "east".into()
    }));
    assert!(matches!(seen.last(), Some(PostGameEvent::Failed { .. })));
}

#[test]
fn completed_run_publishes_progress_and_exports() {
    let game = PlayedGame::shuffled(90, full_tile_set(4));
    let data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    let verifier = game.verifier();
    let mut events = verifier.subscribe();
    verifier
        .initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone())
        .unwrap();
    game.disclose_all(&verifier);

    let mut milestones = Vec::new();
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PostGameEvent::Progress { progress, .. } if progress >= 30 => milestones.push(progress),
            PostGameEvent::Completed(_) => completed = true,
            _ => {}
        }
    }
    assert!(completed);
    assert_eq!(milestones, vec![30, 30, 40, 50, 60, 80, 90, 95]);

    let export = verifier.export_verification_data().unwrap();
    assert_eq!(export.game_id, GAME_ID);
    assert!(export.verification_result.success);
    assert_eq!(export.verification_data.players.len(), 4);
}

#[test]
fn broken_log_is_refused_at_initialize() {
    let game = PlayedGame::shuffled(91, full_tile_set(4));
    let mut data = game.verification_data(&game.draw_discard_round(), BTreeMap::new());
    data.logs.logs[3].previous_hash = "00".repeat(32);
    let verifier = game.verifier();
    assert!(matches!(
        verifier.initialize(data, game.exhaustive_state([25_000; 4]), game.deck.clone()),
        Err(PostGameError::Chain(_))
    ));
    assert_eq!(verifier.phase(), VerificationPhase::Idle);
}
