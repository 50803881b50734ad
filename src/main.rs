use std::env;
use std::time::Duration;

use stagecall::media::HeadlessMedia;
use stagecall::relay::{InboundEvent, RELAY_CONNECTED};
use stagecall::session::RoomId;
use stagecall::{Config, RelayClient, SessionActor, SessionNotice, Signaling};
use tracing::{error, info, warn};

const CONNECT_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let (Some(room), nickname) = (args.next(), args.next()) else {
        eprintln!("Usage: stagecall <room> [nickname]");
        std::process::exit(2);
    };
    let nickname = nickname.unwrap_or_else(|| "listener".to_string());
    let subject_id = env::var("STAGECALL_SUBJECT_ID").unwrap_or_default();

    let config = Config::from_env();
    println!("   Stagecall listener");
    println!("   Server {}", config.relay.server_url);
    println!("   Press Ctrl+C to leave\n");

    let relay = RelayClient::connect(&config.relay);
    let (connected_tx, connected_rx) = async_channel::bounded::<InboundEvent>(1);
    let probe = relay.subscribe(&[RELAY_CONNECTED], connected_tx);
    if tokio::time::timeout(CONNECT_WAIT, connected_rx.recv())
        .await
        .is_err()
    {
        error!("No connection to {} after {:?}", config.relay.server_url, CONNECT_WAIT);
        std::process::exit(1);
    }
    relay.unsubscribe(probe);

    let (session, mut notices) = SessionActor::spawn(relay, HeadlessMedia::default(), config.session);
    match session.join(RoomId::from(room.as_str()), &nickname, &subject_id).await {
        Ok(outcome) => info!("Joined {}, attached {} streams", room, outcome.consumed),
        Err(e) => {
            error!("Could not join {}: {}", room, e);
            std::process::exit(1);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                match notice {
                    // Nothing to draw on; the slide counts as shown immediately
                    SessionNotice::LoadSlide { index, url, generation } => {
                        info!("Slide {} ({})", index, url.as_deref().unwrap_or("-"));
                        if let Err(e) = session.slide_ready(index, generation).await {
                            warn!("Slide {} not ready: {}", index, e);
                        }
                    }
                    SessionNotice::ChatMessage(message) => {
                        println!("<{}> {}", message.nickname, message.text);
                    }
                    SessionNotice::Error(message) => warn!("{}", message),
                    other => info!("{:?}", other),
                }
            }
        }
    }

    session.leave().await;
    info!("Left {}", room);
}
