use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use interview_rtc::{
    start_engine, CaptureFn, ClassifiedStream, Config, EmittedEvents, EngineArgs, LocalTrack,
    PeerId, RemoteMedia, RtcTransportFactory, Side, SignalMessage, StreamRole, TrackKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use example::{init_logger, HttpRelay};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// address of the signaling relay
    #[arg(long, default_value = "127.0.0.1:3000")]
    server: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// open a session and interview whoever joins
    Host {
        /// pull the next candidate in as soon as the host is free
        #[arg(long)]
        auto_start: bool,
        /// end each interview after this many seconds
        #[arg(long)]
        interview_secs: Option<u64>,
    },
    /// join a session and wait in the queue
    Join { code: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger(log::LevelFilter::Debug);
    let cli = Cli::parse();

    let relay = HttpRelay::new(cli.server.clone());
    let id = relay.connect().await?;
    log::info!("connected as {}", id);

    let side = match cli.command {
        Command::Host { .. } => Side::Host,
        Command::Join { .. } => Side::Candidate,
    };

    let config = Config::from_env();
    let factory = RtcTransportFactory::new(&config)?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (handle, _engine) = start_engine(EngineArgs {
        id: id.clone(),
        side,
        factory,
        relay: Arc::new(relay.clone()),
        capture: camera(&id),
        config,
        emitted_event_chan: event_tx,
    })
    .await?;

    let mut session = match cli.command {
        Command::Host {
            auto_start,
            interview_secs,
        } => {
            let reply = relay.request(&id, SignalMessage::CreateSession).await?;
            let code = match reply.code {
                Some(code) if reply.ok => code,
                _ => bail!("failed to create a session: {:?}", reply.error),
            };
            println!("session code: {}", code);
            SessionState {
                code,
                auto_start,
                interview: interview_secs.map(Duration::from_secs),
                queued: 0,
                active: false,
            }
        }
        Command::Join { code } => {
            let reply = relay
                .request(&id, SignalMessage::JoinSession { code: code.clone() })
                .await?;
            if !reply.ok {
                bail!("failed to join {}: {:?}", code, reply.error);
            }
            println!("joined {}, position {}", code, reply.position.unwrap_or(0));
            SessionState {
                code,
                auto_start: false,
                interview: None,
                queued: 0,
                active: false,
            }
        }
    };

    tokio::select! {
        _ = run(&relay, &id, side, &mut session, event_rx) => {
            log::info!("engine stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
        }
    }
    handle.shutdown().await.ok();
    Ok(())
}

struct SessionState {
    code: String,
    auto_start: bool,
    interview: Option<Duration>,
    queued: usize,
    active: bool,
}

impl SessionState {
    async fn maybe_start_next(&mut self, relay: &HttpRelay, id: &PeerId) -> Result<()> {
        if !self.auto_start || self.active || self.queued == 0 {
            return Ok(());
        }
        let reply = relay
            .request(id, SignalMessage::StartNext { code: self.code.clone() })
            .await?;
        if let Some(candidate) = reply.candidate {
            log::info!("starting the interview with {}", candidate);
            self.active = true;
        } else {
            log::warn!("start_next refused: {:?}", reply.error);
        }
        Ok(())
    }
}

async fn run(
    relay: &HttpRelay,
    id: &PeerId,
    side: Side,
    session: &mut SessionState,
    mut events: mpsc::UnboundedReceiver<EmittedEvents<RemoteMedia>>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            EmittedEvents::LinkOpened { peer } => log::info!("link to {} opened", peer),
            EmittedEvents::StreamClassified { peer, stream } => {
                log::info!(
                    "{} sent {} as {:?} ({:?})",
                    peer,
                    stream.stream_id,
                    stream.role,
                    stream.rule
                );
                watch_stream(stream);
            }
            EmittedEvents::StreamRetired {
                peer,
                stream_id,
                role,
            } => log::info!("{} retired {} ({:?})", peer, stream_id, role),
            EmittedEvents::RemoteScreenShare { peer, active } => {
                log::info!("{} screen share active: {}", peer, active)
            }
            EmittedEvents::Disconnected { peer } => log::warn!("lost the connection to {}", peer),
            EmittedEvents::LinkClosed { peer } => log::info!("link to {} closed", peer),
            EmittedEvents::Session { message, .. } => match message {
                SignalMessage::QueueUpdate { queue, you } => {
                    match you {
                        Some(position) => println!("queue position: {}", position),
                        None => println!("{} waiting", queue.len()),
                    }
                    if side == Side::Host {
                        session.queued = queue.len();
                        session.maybe_start_next(relay, id).await?;
                    }
                }
                SignalMessage::CandidateSelected { candidate } => {
                    session.active = true;
                    if let Some(after) = session.interview {
                        end_later(relay.clone(), id.clone(), session.code.clone(), after);
                    }
                    println!("interviewing {}", candidate);
                }
                SignalMessage::InterviewEndedHost => {
                    session.active = false;
                    println!("interview over");
                    session.maybe_start_next(relay, id).await?;
                }
                SignalMessage::InterviewStart { host_id } => {
                    println!("your interview with {} is starting", host_id)
                }
                SignalMessage::InterviewEnded => {
                    println!("the interview has ended");
                    return Ok(());
                }
                SignalMessage::SessionDeleted { code } => {
                    println!("session {} was closed", code);
                    return Ok(());
                }
                other => log::debug!("session message: {}", other.name()),
            },
        }
    }
    Ok(())
}

fn end_later(relay: HttpRelay, id: PeerId, code: String, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Err(e) = relay.request(&id, SignalMessage::EndInterview { code }).await {
            log::error!("failed to end the interview: {}", e);
        }
    });
}

/// counts the packets of each track until it ends
fn watch_stream(stream: ClassifiedStream<RemoteMedia>) {
    for (descriptor, media) in stream.tracks {
        let mut packets = media.subscribe();
        let label = format!("{}/{}", stream.stream_id, descriptor.id);
        tokio::spawn(async move {
            let mut count = 0u64;
            loop {
                match packets.recv().await {
                    Ok(_) => {
                        count += 1;
                        if count % 500 == 0 {
                            log::debug!("{}: {} packets", label, count);
                        }
                    }
                    Err(RecvError::Lagged(n)) => log::warn!("{}: skipped {} packets", label, n),
                    Err(RecvError::Closed) => break,
                }
            }
            log::info!("{} ended after {} packets", label, count);
        });
    }
}

// media capture is up to the embedding application. the tracks are announced
// and negotiated so the far side sees a camera stream
fn camera(id: &PeerId) -> CaptureFn {
    let stream = format!("{}-camera", id);
    let id = id.clone();
    Box::new(move || {
        vec![
            LocalTrack::new(format!("{}-audio", id), stream.clone(), TrackKind::Audio, StreamRole::Camera),
            LocalTrack::new(format!("{}-video", id), stream.clone(), TrackKind::Video, StreamRole::Camera),
        ]
    })
}

