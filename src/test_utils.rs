//! Common test utilities shared across modules.

/// Helpers shared across test modules.
pub mod serde {
    use std::fmt::Debug;

    /// Assert that a value survives a serde_json round-trip using structural equality.
    pub fn assert_round_trip_eq<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned + PartialEq + Debug,
    {
        let json = serde_json::to_string(value)
            .expect("serialization should succeed during round-trip testing");
        let restored: T = serde_json::from_str(&json)
            .expect("deserialization should succeed during round-trip testing");
        assert_eq!(restored, *value, "serde_json round-trip altered the value");
    }

    /// Assert that serde_json emits the same payload before and after round-tripping.
    pub fn assert_round_trip_json<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned,
    {
        let json = serde_json::to_value(value)
            .expect("serialization to value should succeed during round-trip testing");
        let restored: T = serde_json::from_value(json.clone())
            .expect("deserialization from value should succeed during round-trip testing");
        let json_after = serde_json::to_value(restored)
            .expect("re-serialization should succeed during round-trip testing");
        assert_eq!(
            json_after, json,
            "serde_json round-trip altered the payload"
        );
    }
}

/// Seeded peers, a manual clock and signed action streams.
pub mod fixtures {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::clock::ManualClock;
    use crate::config::FairnessConfig;
    use crate::game::{ActionDraft, ActionPayload, DrawData, GameAction};
    use crate::keys::{PeerKeys, PeerPublicKeys, SigningPublicKey};
    use crate::ledger::SignatureService;

    pub const SEAT_NAMES: [&str; 4] = ["east", "south", "west", "north"];
    pub const START_MILLIS: i64 = 1_700_000_000_000;

    pub struct TestTable {
        pub config: FairnessConfig,
        pub clock: Arc<ManualClock>,
        pub peers: Vec<PeerKeys>,
    }

    impl TestTable {
        pub fn new(players: usize, seed: u64) -> Self {
            let mut rng = StdRng::seed_from_u64(seed);
            let peers = SEAT_NAMES
                .iter()
                .take(players)
                .map(|name| PeerKeys::generate(*name, &mut rng))
                .collect();
            Self {
                config: FairnessConfig::default(),
                clock: Arc::new(ManualClock::new(START_MILLIS)),
                peers,
            }
        }

        pub fn peer_id(&self, seat: usize) -> String {
            self.peers[seat].peer_id.clone()
        }

        pub fn signing_public(&self, seat: usize) -> SigningPublicKey {
            self.peers[seat].signing.public_key()
        }

        pub fn announcements(&self) -> Vec<PeerPublicKeys> {
            self.peers.iter().map(PeerKeys::public).collect()
        }

        pub fn seat_ids(&self) -> Vec<String> {
            self.peers.iter().map(|peer| peer.peer_id.clone()).collect()
        }

        /// Signs `payload` as `seat`, one millisecond after the previous action.
        pub fn sign(&self, seat: usize, payload: &ActionPayload) -> GameAction {
            self.clock.advance(1);
            let signer = SignatureService::new(&self.config, self.clock.clone());
            signer.sign(
                ActionDraft::new(self.peer_id(seat), payload),
                &self.peers[seat].signing,
            )
        }
    }

    /// `count` DRAW actions from `seat` with distinct ids and increasing timestamps.
    pub fn signed_draws(table: &TestTable, seat: usize, count: u32) -> Vec<GameAction> {
        (0..count)
            .map(|i| {
                table.sign(
                    seat,
                    &ActionPayload::Draw(DrawData {
                        tile_index: 60 + i,
                    }),
                )
            })
            .collect()
    }
}
