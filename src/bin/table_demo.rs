//! Runs a four-seat table end to end over the in-memory hub:
//! key announcement, turn-ordered shuffle, a short draw/discard script with
//! layer-by-layer tile reveals, key disclosure, and post-game verification
//! on every peer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use legit_mahjong::clock::{system_clock, SharedClock};
use legit_mahjong::game::{
    ActionPayload, DiscardData, DrawData, GameStartData, HandJudge, StructuralJudge,
};
use legit_mahjong::keys::PeerKeys;
use legit_mahjong::postgame::{EndCondition, FinalGameState, PostGameState};
use legit_mahjong::session::{InMemoryHub, InMemoryTransport, PeerSession};
use legit_mahjong::tiles::Tile;
use legit_mahjong::tokio_tools::spawn_named_task;
use legit_mahjong::FairnessConfig;

const LOG_TARGET: &str = "bin::table_demo";
const SEATS: [&str; 4] = ["east", "south", "west", "north"];
/// Dealer takes 14 tiles, the other three seats 13 each.
const WALL_START: u32 = 14 + 3 * 13;

type Session = Arc<PeerSession<InMemoryTransport>>;

#[derive(Debug, Parser)]
#[command(name = "table_demo")]
#[command(about = "Play and verify a mental-mahjong table with four in-process peers", long_about = None)]
struct Args {
    /// Optional RNG seed for deterministic keys and shuffles
    #[arg(long, env = "TABLE_DEMO_SEED")]
    seed: Option<u64>,

    /// Game identifier shared by every peer
    #[arg(long, default_value = "demo-table")]
    game_id: String,

    /// Draw/discard turns before the wall is declared exhausted
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(3..=80))]
    turns: u32,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "TABLE_DEMO_LOG_JSON", default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let args = Args::parse();
    init_tracing(args.json)?;
    let config = FairnessConfig::from_env().context("invalid LEGIT_MAHJONG_* configuration")?;
    run_table(args, config).await
}

fn load_dotenv() {
    let manifest_env = env!("CARGO_MANIFEST_DIR");
    let manifest_env_path = PathBuf::from(manifest_env).join(".env");
    dotenv::from_filename(manifest_env_path).ok();
    dotenv::dotenv().ok();
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::fmt().with_env_filter(filter).with_target(true);

    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

async fn run_table(args: Args, config: FairnessConfig) -> Result<()> {
    let mut rng = args
        .seed
        .map(StdRng::seed_from_u64)
        .unwrap_or_else(StdRng::from_entropy);
    let clock = system_clock();
    let sessions = seat_peers(&args.game_id, &config, clock, &mut rng)?;

    for session in &sessions {
        session.announce().await?;
    }
    pump(&sessions)?;
    if !sessions.iter().all(|s| s.is_table_ready()) {
        bail!("not every peer saw the full roster");
    }

    shuffle(&sessions, &mut rng).await?;
    play(&sessions, args.turns).await?;

    sessions[0].sync_state().await?;
    for event in sessions[1..]
        .iter()
        .map(|s| s.drain())
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
    {
        info!(target: LOG_TARGET, ?event, "state sync");
    }

    let final_state = FinalGameState {
        game_id: args.game_id.clone(),
        players: SEATS.iter().map(|s| s.to_string()).collect(),
        final_scores: SEATS
            .iter()
            .map(|s| (s.to_string(), config.starting_points))
            .collect(),
        winner: None,
        end_condition: EndCondition::Exhaustive,
    };
    let verdicts = verify_everywhere(&sessions, final_state).await?;

    println!("\n=== Post-game verdicts for {} ===", args.game_id);
    let mut all_passed = true;
    for (peer, state) in &verdicts {
        match &state.verification_result {
            Some(result) => {
                all_passed &= result.success;
                println!(
                    "{peer:>6}: {:?} success={} deck={} actions={} proofs={} final_state={} digest={}",
                    state.phase,
                    result.success,
                    result.initial_deck_valid,
                    result.actions_valid,
                    result.proofs_valid,
                    result.final_state_valid,
                    result.verification_proof.digest,
                );
                for error in &result.errors {
                    println!("        - {error}");
                }
            }
            None => {
                all_passed = false;
                println!(
                    "{peer:>6}: {:?} {}",
                    state.phase,
                    state.error.as_deref().unwrap_or("no result")
                );
            }
        }
    }
    if !all_passed {
        bail!("at least one peer could not verify the game");
    }
    Ok(())
}

fn seat_peers(
    game_id: &str,
    config: &FairnessConfig,
    clock: SharedClock,
    rng: &mut StdRng,
) -> Result<Vec<Session>> {
    let hub = InMemoryHub::new();
    let seats: Vec<String> = SEATS.iter().map(|s| s.to_string()).collect();
    SEATS
        .iter()
        .map(|seat| -> Result<Session> {
            let keys = PeerKeys::generate(*seat, rng);
            info!(
                target: LOG_TARGET,
                peer_id = %keys.peer_id,
                signing = %keys.signing.public_key().fingerprint(),
                "generated peer keys"
            );
            let transport = hub.join(*seat)?;
            Ok(Arc::new(PeerSession::new(
                keys,
                game_id,
                seats.clone(),
                config,
                clock.clone(),
                transport,
            )))
        })
        .collect()
}

fn pump(sessions: &[Session]) -> Result<()> {
    for session in sessions {
        session.drain()?;
    }
    Ok(())
}

async fn shuffle(sessions: &[Session], rng: &mut StdRng) -> Result<()> {
    while !sessions.iter().all(|s| s.is_shuffle_complete()) {
        let mut moved = false;
        for session in sessions {
            if session.take_shuffle_turn(rng).await? {
                info!(target: LOG_TARGET, peer_id = session.peer_id(), "shuffle pass handed on");
                moved = true;
            }
            pump(sessions)?;
        }
        if !moved {
            bail!("shuffle stalled: no peer holds the turn");
        }
    }
    Ok(())
}

/// Every peer strips its layer, last seat first; the final layer yields the tile.
async fn open_tile(sessions: &[Session], tile_index: u32) -> Result<Tile> {
    for session in sessions.iter().rev() {
        session.reveal_layer(tile_index).await?;
        pump(sessions)?;
    }
    sessions[0]
        .opened_tile(tile_index)
        .with_context(|| format!("tile {tile_index} did not open"))
}

async fn play(sessions: &[Session], turns: u32) -> Result<()> {
    let players = sessions.iter().map(|s| s.peer_id().to_string()).collect();
    sessions[0]
        .act(&ActionPayload::GameStart(GameStartData {
            players,
            seed: None,
        }))
        .await?;
    pump(sessions)?;

    for turn in 0..turns {
        let seat = (turn as usize + 1) % sessions.len();
        let position = WALL_START + turn;
        let player = &sessions[seat];
        player
            .act(&ActionPayload::Draw(DrawData {
                tile_index: position,
            }))
            .await?;
        pump(sessions)?;
        let tile = open_tile(sessions, position).await?;
        player
            .act(&ActionPayload::Discard(DiscardData {
                tile_index: position,
                tile,
            }))
            .await?;
        pump(sessions)?;
        info!(target: LOG_TARGET, turn, peer_id = player.peer_id(), %tile, "discarded");
    }
    for session in sessions {
        let invalid = session.verifier().invalid_actions();
        if !invalid.is_empty() {
            warn!(target: LOG_TARGET, peer_id = session.peer_id(), count = invalid.len(), "peer rejected actions");
        }
    }
    Ok(())
}

/// Each peer discloses its key, waits for the others and verifies on its own task.
async fn verify_everywhere(
    sessions: &[Session],
    final_state: FinalGameState,
) -> Result<Vec<(String, PostGameState)>> {
    let judge: Arc<dyn HandJudge> = Arc::new(StructuralJudge);
    let tasks: Vec<_> = sessions
        .iter()
        .map(|session| {
            let session = Arc::clone(session);
            let final_state = final_state.clone();
            let judge = Arc::clone(&judge);
            let peer_id = session.peer_id().to_string();
            spawn_named_task(format!("postgame-{peer_id}"), async move {
                session.disclose_key().await?;
                while !session.disclosures_complete() {
                    session.recv_and_handle().await?;
                }
                session.run_post_game(final_state, judge)
            })
            .with_context(|| format!("failed to spawn post-game task for {peer_id}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut verdicts = Vec::with_capacity(tasks.len());
    for (session, task) in sessions.iter().zip(tasks) {
        let state = task
            .await
            .context("post-game task panicked")?
            .with_context(|| format!("post-game verification failed on {}", session.peer_id()))?;
        verdicts.push((session.peer_id().to_string(), state));
    }
    Ok(verdicts)
}
