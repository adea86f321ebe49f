use std::path::PathBuf;

use color_eyre::Result;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqsession::config::Config;
use mqsession::net;
use mqsession::{BrokerSession, ClientSession, EventDispatcher, EventStream, QoS, SessionEvent};

/// Volume topic from the headset demo this binary reenacts.
const VOLUME_TOPIC: &str = "quest/volume";

/// Platform capability for reading a system volume. The demo publishes the
/// value when a probe can supply one; sessions never depend on this.
trait VolumeProbe: Send {
    fn current_volume(&self) -> Option<i32>;
}

/// Desktop builds have no system volume query.
struct PlatformVolumeProbe;

impl VolumeProbe for PlatformVolumeProbe {
    fn current_volume(&self) -> Option<i32> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let dispatcher = EventDispatcher::new();
    let events = dispatcher.subscribe();
    let handle = dispatcher.handle();

    let mut broker = None;
    if config.broker.enabled {
        let mut session = BrokerSession::new("embedded-broker", handle.clone());
        let listening = session.start(config.broker.listen_options()).await?;
        let shown = net::local_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "localhost".to_string());
        println!("Broker listening on {}:{}", shown, listening.local_addr.port());
        broker = Some(session);
    }

    let mut client = None;
    if config.client.enabled {
        let mut session = ClientSession::new("demo-client", handle.clone());
        session.connect(config.client.endpoint()).await?;
        client = Some(session);
    }

    let probe: Box<dyn VolumeProbe> = Box::new(PlatformVolumeProbe);
    run_event_loop(events, &mut client, &config, probe.as_ref()).await;

    if let Some(mut session) = client {
        session.disconnect().await;
    }
    if let Some(mut session) = broker {
        session.stop().await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Prints every session event until ctrl-c. When our own client reaches
/// `Connected` it runs the demo flow once.
async fn run_event_loop(
    mut events: EventStream,
    client: &mut Option<ClientSession>,
    config: &Config,
    probe: &dyn VolumeProbe,
) {
    let client_session_id = client.as_ref().map(|session| session.id());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-c received, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    SessionEvent::StateChanged { session, state } => {
                        println!("[{}] state: {}", session, state.status);
                        if let Some(error) = &state.last_error {
                            println!("[{}]   error: {}", session, error);
                        }
                        if Some(*session) == client_session_id && state.is_connected() {
                            if let Some(session) = client.as_mut() {
                                greet(session, config, probe).await;
                            }
                        }
                    }
                    SessionEvent::ClientConnected { session, client_id } => {
                        println!("[{}] client {} connected", session, client_id);
                    }
                    SessionEvent::ClientDisconnected { session, client_id, reason } => {
                        println!("[{}] client {} disconnected: {}", session, client_id, reason);
                    }
                    SessionEvent::MessageReceived { session, message } => {
                        println!("[{}] {}", session, message);
                    }
                }
            }
        }
    }
}

/// The original demo flow: subscribe to the demo topic, announce ourselves,
/// and report the system volume when the platform can supply one.
async fn greet(session: &mut ClientSession, config: &Config, probe: &dyn VolumeProbe) {
    let topic = config.client.topic.clone();
    if let Err(e) = session.subscribe(topic.clone(), config.client.qos()).await {
        warn!("Demo subscribe failed: {}", e);
        return;
    }
    if let Err(e) = session
        .publish(
            topic,
            config.client.payload.clone(),
            config.client.qos(),
            config.client.retain,
        )
        .await
    {
        warn!("Demo publish failed: {}", e);
    }
    match probe.current_volume() {
        Some(volume) => {
            if let Err(e) = session.subscribe(VOLUME_TOPIC, QoS::AtLeastOnce).await {
                warn!("Volume subscribe failed: {}", e);
            }
            let payload = format!("{{\"volume\":{}}}", volume);
            if let Err(e) = session
                .publish(VOLUME_TOPIC, payload, QoS::AtLeastOnce, true)
                .await
            {
                warn!("Volume publish failed: {}", e);
            }
        }
        None => info!("Volume probe unavailable on this platform"),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
