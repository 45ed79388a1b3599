use busfleet::protocol::{CommandType, ProtocolHandler, ResponseStatus};
use busfleet::{FleetSimulator, SimulationConfig};
use clap::{App, Arg};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn};

const EVENT_BROADCAST_BUFFER_SIZE: usize = 1024;

type SharedSimulator = Arc<Mutex<FleetSimulator>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("fleet-simulator")
        .version("0.1.0")
        .about("Electric bus fleet simulator host")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port to listen on (overrides the config file)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("turbo")
                .long("turbo")
                .help("Start in turbo mode"),
        )
        .arg(
            Arg::with_name("paused")
                .long("paused")
                .help("Do not start the clock until a Start command arrives"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => SimulationConfig::from_json_file(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(port) = matches.value_of("port") {
        config.tcp_port = port.parse()?;
    }
    if matches.is_present("turbo") {
        config.turbo = true;
    }
    if matches.is_present("paused") {
        config.autostart = false;
    }

    println!("🚌 Electric Bus Fleet Simulator");
    println!("===============================");

    let port = config.tcp_port;
    let tick_interval = Duration::from_millis(config.tick_interval_ms);
    let autostart = config.autostart;

    let simulator = Arc::new(Mutex::new(FleetSimulator::new(config)?));
    {
        let mut sim = simulator.lock().await;
        info!(
            buses = sim.registry().len(),
            seconds_per_tick = sim.driver().tick_duration_ms() / 1000,
            "Simulator ready"
        );
        if autostart {
            sim.start();
        }
    }

    let (event_tx, _) = broadcast::channel::<String>(EVENT_BROADCAST_BUFFER_SIZE);

    let tcp_simulator = Arc::clone(&simulator);
    let tcp_event_tx = event_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(port, tcp_simulator, tcp_event_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let mut serializer = ProtocolHandler::new();
    let mut interval = time::interval(tick_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }

        let (tick_result, events) = {
            let mut sim = simulator.lock().await;
            let result = sim.tick();
            (result, sim.drain_events())
        };

        match tick_result {
            Ok(Some(report)) => {
                if !report.transitions.is_empty() || !report.low_battery.is_empty() {
                    info!(
                        tick = report.tick,
                        clock_ms = report.clock_ms,
                        transitions = report.transitions.len(),
                        low_battery = report.low_battery.len(),
                        "Tick"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => error!("❌ Tick failed, simulation stopped: {}", e),
        }

        // No receivers is the normal case when nobody subscribed.
        if event_tx.receiver_count() == 0 {
            continue;
        }
        for event in &events {
            match serializer.serialize_event(event) {
                Ok(line) => {
                    let _ = event_tx.send(line);
                }
                Err(e) => warn!("Failed to encode event: {}", e),
            }
        }
    }

    simulator.lock().await.stop();
    tcp_server.abort();
    println!("🚌 Fleet simulator stopped");

    Ok(())
}

async fn start_tcp_server(
    port: u16,
    simulator: SharedSimulator,
    event_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("🌐 TCP server listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 Client connected: {}", addr);
                let client_simulator = Arc::clone(&simulator);
                let client_event_tx = event_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_simulator, client_event_tx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("🔌 Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    simulator: SharedSimulator,
    event_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));
    let mut handler = ProtocolHandler::new();
    let mut event_task: Option<tokio::task::JoinHandle<()>> = None;

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match handler.parse_command(trimmed) {
                    Ok(command) => {
                        debug!("📨 Received command: {:?}", command);
                        let id = command.id;
                        let subscribe = command.command_type == CommandType::Subscribe;

                        let response = {
                            let mut sim = simulator.lock().await;
                            match sim.queue_command(command) {
                                Ok(()) => {
                                    sim.process_commands();
                                    sim.take_responses().into_iter().find(|r| r.id == id)
                                }
                                Err(e) => Some(handler.create_response(
                                    id,
                                    ResponseStatus::Error,
                                    Some(&format!("Queue error: {}", e)),
                                )),
                            }
                        }
                        .unwrap_or_else(|| {
                            handler.create_response(id, ResponseStatus::Error, Some("no response produced"))
                        });

                        if subscribe && response.status == ResponseStatus::Success && event_task.is_none() {
                            event_task = Some(spawn_event_stream(event_tx.subscribe(), Arc::clone(&writer)));
                        }
                        response
                    }
                    Err(e) => {
                        warn!("Failed to parse command: {}", e);
                        handler.create_response(
                            0,
                            ResponseStatus::InvalidCommand,
                            Some(&format!("Invalid command format: {}", e)),
                        )
                    }
                };

                let response_json = match handler.serialize_response(&response) {
                    Ok(json) => json,
                    Err(e) => {
                        let fallback = handler.create_response(
                            response.id,
                            ResponseStatus::Error,
                            Some(&format!("Response could not be sent: {}", e)),
                        );
                        serde_json::to_string(&fallback)?
                    }
                };

                let mut writer_guard = writer.lock().await;
                writer_guard.write_all(response_json.as_bytes()).await?;
                writer_guard.write_all(b"\n").await?;
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    if let Some(task) = event_task {
        task.abort();
    }
    Ok(())
}

fn spawn_event_stream(
    mut event_rx: broadcast::Receiver<String>,
    writer: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(line) => {
                    let mut writer_guard = writer.lock().await;
                    if let Err(e) = writer_guard.write_all(line.as_bytes()).await {
                        warn!("Failed to send event: {}", e);
                        break;
                    }
                    if let Err(e) = writer_guard.write_all(b"\n").await {
                        warn!("Failed to send event newline: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
