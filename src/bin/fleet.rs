use busfleet::protocol::{
    BusSnapshot, Command, CommandResponse, CommandType, FleetSnapshot, NegotiationSnapshot,
    ResponseStatus,
};
use busfleet::{BusStatus, FleetEvent, Month, ReplacementOutcome, RouteName};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const COMMAND_TIMEOUT_SECS: u64 = 5;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

struct Target<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

#[tokio::main]
async fn main() -> CliResult {
    let status_names: Vec<&str> = BusStatus::ALL.iter().map(|s| s.name()).collect();
    let route_names: Vec<&str> = RouteName::served().iter().map(|r| r.name()).collect();

    let matches = App::new("fleet")
        .version("0.1.0")
        .about("🚌 Electric bus fleet simulator client")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Check the simulator is responsive"))
        .subcommand(SubCommand::with_name("status").about("📊 Show the whole fleet"))
        .subcommand(
            SubCommand::with_name("bus")
                .about("🔎 Show one bus")
                .arg(Arg::with_name("id").help("Bus id").required(true)),
        )
        .subcommand(SubCommand::with_name("start").about("▶️  Start the simulation clock"))
        .subcommand(SubCommand::with_name("stop").about("⏸️  Stop the simulation clock"))
        .subcommand(
            SubCommand::with_name("tick")
                .about("⏭️  Advance the simulation immediately")
                .arg(
                    Arg::with_name("count")
                        .help("Number of ticks")
                        .default_value("1")
                        .validator(|v| match v.parse::<u32>() {
                            Ok(n) if n > 0 => Ok(()),
                            _ => Err("Tick count must be a positive number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("tick-rate")
                .about("⏱️  Set simulated seconds per tick")
                .arg(
                    Arg::with_name("seconds")
                        .required(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(n) if n > 0 => Ok(()),
                            _ => Err("Seconds per tick must be a positive number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("turbo")
                .about("🚀 Toggle turbo mode")
                .arg(
                    Arg::with_name("state")
                        .required(true)
                        .possible_values(&["on", "off", "enable", "disable"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("weather")
                .about("🌦️  Set month and rain")
                .arg(
                    Arg::with_name("month")
                        .help("Month name, e.g. January")
                        .required(true)
                        .validator(|v| match Month::from_name(&v) {
                            Some(_) => Ok(()),
                            None => Err(format!("Unknown month '{}'", v)),
                        }),
                )
                .arg(Arg::with_name("rain").long("rain").help("It is raining")),
        )
        .subcommand(
            SubCommand::with_name("replace")
                .about("🔁 Answer the open replacement negotiation")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("select")
                        .about("Dispatch a candidate")
                        .arg(Arg::with_name("candidate").required(true)),
                )
                .subcommand(SubCommand::with_name("postpone").about("Ask again in 30 simulated minutes"))
                .subcommand(SubCommand::with_name("cancel").about("Close without dispatching"))
                .subcommand(SubCommand::with_name("status").about("Show the open negotiation")),
        )
        .subcommand(
            SubCommand::with_name("assign")
                .about("🛣️  Dispatch a garaged bus onto a route")
                .arg(Arg::with_name("bus").required(true))
                .arg(
                    Arg::with_name("route")
                        .required(true)
                        .possible_values(&route_names),
                ),
        )
        .subcommand(
            SubCommand::with_name("set-status")
                .about("🛠️  Override a bus status")
                .arg(Arg::with_name("bus").required(true))
                .arg(
                    Arg::with_name("status")
                        .required(true)
                        .possible_values(&status_names),
                ),
        )
        .subcommand(
            SubCommand::with_name("set-battery")
                .about("🔋 Record a measured battery level")
                .arg(Arg::with_name("bus").required(true))
                .arg(
                    Arg::with_name("level")
                        .required(true)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(l) if (0.0..=100.0).contains(&l) => Ok(()),
                            _ => Err("Battery level must be between 0 and 100".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("📡 Stream fleet events"))
        .get_matches();

    let target = Target {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST),
        port: matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?,
        format: matches.value_of("format").unwrap_or("table"),
    };

    match matches.subcommand() {
        ("ping", _) => {
            let response = send_command(&target, CommandType::Ping).await?;
            print_result("Ping", "pong", &response, target.format);
        }
        ("status", _) => {
            let response = send_command(&target, CommandType::FleetStatus).await?;
            print_fleet_status(&response, target.format)?;
        }
        ("bus", Some(sub)) => {
            let bus_id = sub.value_of("id").unwrap_or_default().to_string();
            let response = send_command(&target, CommandType::BusStatus { bus_id }).await?;
            print_bus_status(&response, target.format)?;
        }
        ("start", _) => {
            let response = send_command(&target, CommandType::Start).await?;
            print_result("Simulation", "RUNNING", &response, target.format);
        }
        ("stop", _) => {
            let response = send_command(&target, CommandType::Stop).await?;
            print_result("Simulation", "STOPPED", &response, target.format);
        }
        ("tick", Some(sub)) => {
            let count: u32 = sub.value_of("count").unwrap_or("1").parse()?;
            let response = send_command(&target, CommandType::Tick { count }).await?;
            print_result("Tick", &format!("{} step(s)", count), &response, target.format);
        }
        ("tick-rate", Some(sub)) => {
            let seconds_per_tick: u64 = sub.value_of("seconds").unwrap_or_default().parse()?;
            let response = send_command(&target, CommandType::SetTickRate { seconds_per_tick }).await?;
            print_result("Tick Rate", &format!("{} s/tick", seconds_per_tick), &response, target.format);
        }
        ("turbo", Some(sub)) => {
            let enabled = normalize_state(sub.value_of("state").unwrap_or("off"));
            let response = send_command(&target, CommandType::SetTurbo { enabled }).await?;
            print_result("Turbo", if enabled { "ON" } else { "OFF" }, &response, target.format);
        }
        ("weather", Some(sub)) => {
            let month = Month::from_name(sub.value_of("month").unwrap_or_default())
                .ok_or("unknown month")?;
            let raining = sub.is_present("rain");
            let response = send_command(&target, CommandType::SetWeather { month, raining }).await?;
            let label = format!("{:?}{}", month, if raining { ", rain" } else { "" });
            print_result("Weather", &label, &response, target.format);
        }
        ("replace", Some(sub)) => handle_replace(sub, &target).await?,
        ("assign", Some(sub)) => {
            let bus_id = sub.value_of("bus").unwrap_or_default().to_string();
            let route = RouteName::from_name(sub.value_of("route").unwrap_or_default())
                .ok_or("unknown route")?;
            let label = format!("{} → {}", bus_id, route);
            let response = send_command(&target, CommandType::AssignIntercept { bus_id, route }).await?;
            print_result("Intercept", &label, &response, target.format);
        }
        ("set-status", Some(sub)) => {
            let bus_id = sub.value_of("bus").unwrap_or_default().to_string();
            let status = BusStatus::from_name(sub.value_of("status").unwrap_or_default())
                .ok_or("unknown status")?;
            let label = format!("{} → {}", bus_id, status);
            let response = send_command(&target, CommandType::SetBusStatus { bus_id, status }).await?;
            print_result("Status", &label, &response, target.format);
        }
        ("set-battery", Some(sub)) => {
            let bus_id = sub.value_of("bus").unwrap_or_default().to_string();
            let level: f64 = sub.value_of("level").unwrap_or_default().parse()?;
            let label = format!("{} at {:.1}%", bus_id, level);
            let response = send_command(&target, CommandType::SetBatteryLevel { bus_id, level }).await?;
            print_result("Battery", &label, &response, target.format);
        }
        ("monitor", _) => monitor_events(&target).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
        }
    }

    Ok(())
}

async fn handle_replace(matches: &ArgMatches<'_>, target: &Target<'_>) -> CliResult {
    match matches.subcommand() {
        ("select", Some(sub)) => {
            let candidate_id = sub.value_of("candidate").unwrap_or_default().to_string();
            let label = candidate_id.clone();
            let response = send_command(target, CommandType::SelectReplacement { candidate_id }).await?;
            print_result("Replacement", &label, &response, target.format);
        }
        ("postpone", _) => {
            let response = send_command(target, CommandType::PostponeReplacement).await?;
            print_result("Replacement", "postponed", &response, target.format);
        }
        ("cancel", _) => {
            let response = send_command(target, CommandType::CancelReplacement).await?;
            print_result("Replacement", "cancelled", &response, target.format);
        }
        ("status", _) => {
            let response = send_command(target, CommandType::NegotiationStatus).await?;
            print_negotiation(&response, target.format)?;
        }
        _ => {
            println!("{}", "Replace subcommand required. Use 'fleet replace --help' for options.".yellow());
        }
    }
    Ok(())
}

fn build_command(command_type: CommandType) -> Command {
    let timestamp = busfleet::protocol::unix_millis();
    Command {
        // Any non-zero id works; responses are matched per connection.
        id: (timestamp % u64::from(u32::MAX)) as u32 | 1,
        timestamp,
        command_type,
    }
}

async fn connect(target: &Target<'_>) -> CliResult<TcpStream> {
    let addr = format!("{}:{}", target.host, target.port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to fleet simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin fleet-simulator".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

async fn send_command(target: &Target<'_>, command_type: CommandType) -> CliResult<String> {
    let stream = connect(target).await?;
    let (reader, mut writer) = stream.into_split();
    let payload = serde_json::to_string(&build_command(command_type))?;

    let exchange = async {
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut line = String::new();
        let n = BufReader::new(reader).read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Server closed connection",
            ));
        }
        Ok(line.trim_end().to_string())
    };

    match tokio::time::timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} Command timed out after {} seconds", "⏰".yellow(), COMMAND_TIMEOUT_SECS);
            Err("Command timeout".into())
        }
    }
}

fn normalize_state(state: &str) -> bool {
    matches!(state, "on" | "enable")
}

fn colored_status(status: ResponseStatus) -> ColoredString {
    match status {
        ResponseStatus::Success => "✅".green(),
        ResponseStatus::Rejected => "⛔".yellow(),
        ResponseStatus::InvalidCommand | ResponseStatus::Error => "❌".red(),
    }
}

fn colored_level(level: f64) -> ColoredString {
    let text = format!("{:>5.1}%", level);
    if level >= 50.0 {
        text.bright_green()
    } else if level >= 30.0 {
        text.yellow()
    } else {
        text.bright_red()
    }
}

fn colored_bus_status(status: BusStatus) -> ColoredString {
    let text = format!("{:<9}", status.name());
    match status {
        BusStatus::Inroute => text.bright_green(),
        BusStatus::Intercept => text.bright_cyan(),
        BusStatus::Returning => text.yellow(),
        BusStatus::Charging => text.bright_blue(),
        BusStatus::Garage | BusStatus::Free => text.white(),
        BusStatus::Repair => text.bright_red(),
    }
}

fn print_result(label: &str, value: &str, raw: &str, format: &str) {
    if format == "json" {
        println!("{}", raw);
        return;
    }
    match serde_json::from_str::<CommandResponse>(raw) {
        Ok(response) => {
            let detail = response.message.unwrap_or_default();
            if format == "compact" {
                println!("{:?} {}", response.status, detail);
            } else {
                println!(
                    "{} {}: {} {}",
                    colored_status(response.status),
                    label.bright_white(),
                    value.bright_cyan(),
                    detail.dimmed()
                );
            }
        }
        Err(_) => println!("{}", raw),
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(raw: &str) -> CliResult<Result<T, CommandResponse>> {
    let response: CommandResponse = serde_json::from_str(raw)?;
    match (response.status, response.data.clone()) {
        (ResponseStatus::Success, Some(data)) => Ok(Ok(serde_json::from_value(data)?)),
        _ => Ok(Err(response)),
    }
}

fn print_failure(response: &CommandResponse) {
    println!(
        "{} {}",
        colored_status(response.status),
        response.message.as_deref().unwrap_or("request failed").bright_red()
    );
}

fn print_fleet_status(raw: &str, format: &str) -> CliResult {
    if format == "json" {
        println!("{}", raw);
        return Ok(());
    }
    let snapshot: FleetSnapshot = match decode_data(raw)? {
        Ok(snapshot) => snapshot,
        Err(response) => {
            print_failure(&response);
            return Ok(());
        }
    };

    let minutes = snapshot.clock_ms / 60_000;
    let state = if snapshot.running { "RUNNING".bright_green() } else { "STOPPED".yellow() };
    println!(
        "{} {} {} tick {} | {:02}:{:02} simulated | {:?}{} ×{:.1} | {} s/tick{}",
        "🚌".bright_blue(),
        "Fleet".bright_blue().bold(),
        state,
        snapshot.tick,
        minutes / 60,
        minutes % 60,
        snapshot.weather.month,
        if snapshot.weather.raining { " rain" } else { "" },
        snapshot.consumption_multiplier,
        snapshot.seconds_per_tick,
        if snapshot.turbo { " (turbo)" } else { "" },
    );

    let c = snapshot.counts;
    println!(
        "   inroute {} | intercept {} | returning {} | charging {} | garage {} | free {} | repair {} | avg {}",
        c.inroute, c.intercept, c.returning, c.charging, c.garage, c.free, c.repair,
        colored_level(snapshot.average_battery_level)
    );

    if format == "compact" {
        return Ok(());
    }

    println!("{}", "┌──────────┬────────────┬───────────┬───────┬─────────┬─────────┬──────────┐".bright_white());
    println!("{}", "│ Bus      │ Model      │ Status    │ Route │ Battery │ In min  │ Reserve  │".bright_white());
    println!("{}", "├──────────┼────────────┼───────────┼───────┼─────────┼─────────┼──────────┤".bright_white());
    for bus in &snapshot.buses {
        print_bus_row(bus);
    }
    println!("{}", "└──────────┴────────────┴───────────┴───────┴─────────┴─────────┴──────────┘".bright_white());

    if let Some(negotiation) = &snapshot.negotiation {
        println!(
            "{} Replacement needed for {} on {} | candidates: {}",
            "⚠️ ".yellow(),
            negotiation.bus_id.bright_red(),
            negotiation.route,
            negotiation.candidates.join(", ")
        );
    }
    Ok(())
}

fn print_bus_row(bus: &BusSnapshot) {
    let reserve = bus
        .hours_until_reserve
        .map_or_else(|| "-".to_string(), |h| format!("{:.1} h", h));
    println!(
        "│ {:<8} │ {:<10} │ {} │ {:<5} │ {}  │ {:>7.1} │ {:>8} │",
        bus.id,
        bus.model.name(),
        colored_bus_status(bus.status),
        bus.route.name(),
        colored_level(bus.battery_level),
        bus.time_in_status_minutes,
        reserve
    );
}

fn print_bus_status(raw: &str, format: &str) -> CliResult {
    if format == "json" {
        println!("{}", raw);
        return Ok(());
    }
    match decode_data::<BusSnapshot>(raw)? {
        Ok(bus) => {
            println!("{} {}", "🚌".bright_blue(), bus.id.bright_blue().bold());
            println!("   {} {} ({})", "Model:".bright_white(), bus.model, bus.year);
            println!("   {} {}", "Status:".bright_white(), colored_bus_status(bus.status));
            println!("   {} {}", "Route:".bright_white(), bus.route);
            println!("   {} {}", "Battery:".bright_white(), colored_level(bus.battery_level));
            println!("   {} {:.1} min", "In status:".bright_white(), bus.time_in_status_minutes);
            if let Some(hours) = bus.hours_until_reserve {
                println!("   {} {:.1} h", "Until reserve:".bright_white(), hours);
            }
            if let Some(other) = &bus.replacing_bus {
                println!("   {} {}", "Replacing:".bright_white(), other.bright_cyan());
            }
            if bus.is_critical {
                println!("   {}", "CRITICAL BATTERY".bright_red().bold());
            }
        }
        Err(response) => print_failure(&response),
    }
    Ok(())
}

fn print_negotiation(raw: &str, format: &str) -> CliResult {
    if format == "json" {
        println!("{}", raw);
        return Ok(());
    }
    let snapshot: NegotiationSnapshot = match decode_data(raw)? {
        Ok(snapshot) => snapshot,
        Err(response) => {
            print_failure(&response);
            return Ok(());
        }
    };

    match &snapshot.active {
        Some(n) => {
            println!(
                "{} Negotiation #{} for {} on {}",
                "🔁".bright_blue(),
                n.id,
                n.bus_id.bright_red(),
                n.route
            );
            if n.candidates.is_empty() {
                println!("   {}", "No garaged bus has enough charge".yellow());
            } else {
                println!("   {} {}", "Candidates:".bright_white(), n.candidates.join(", ").bright_cyan());
            }
            let postpone = if n.can_postpone() {
                format!("{} of {} used", n.postpone_count, n.max_postponements).normal()
            } else {
                "limit reached".bright_red()
            };
            println!("   {} {}", "Postponements:".bright_white(), postpone);
        }
        None => println!("{} {}", "✅".green(), "No open negotiation".bright_green()),
    }
    for reopen in &snapshot.pending_reopens {
        println!(
            "   {} {} reopens at {} min",
            "⏳".yellow(),
            reopen.bus_id,
            reopen.due_at_ms / 60_000
        );
    }
    Ok(())
}

async fn monitor_events(target: &Target<'_>) -> CliResult {
    let stream = connect(target).await?;
    let (reader, mut writer) = stream.into_split();
    let payload = serde_json::to_string(&build_command(CommandType::Subscribe))?;
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    println!("{}", "📡 Streaming fleet events (Press Ctrl+C to stop)...".bright_blue().bold());

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if target.format == "json" {
            println!("{}", line);
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => continue,
        };
        // The first line is the Subscribe response.
        if value.get("event").is_none() {
            continue;
        }
        match serde_json::from_value::<FleetEvent>(value) {
            Ok(event) => print_event(&event, target.format),
            Err(_) => println!("{}", line),
        }
    }
    Ok(())
}

fn print_event(event: &FleetEvent, format: &str) {
    match event {
        FleetEvent::StatusChanged { bus_id, from, to, at_ms } => println!(
            "{} {} {} → {}",
            clock(*at_ms),
            bus_id.bright_white(),
            from,
            colored_bus_status(*to)
        ),
        FleetEvent::BatteryLevelChanged { bus_id, level, at_ms } => {
            if format != "compact" {
                println!("{} {} {}", clock(*at_ms), bus_id.dimmed(), colored_level(*level));
            }
        }
        FleetEvent::LowBatteryCrossed { bus_id, level, route, at_ms } => println!(
            "{} {} {} low battery {} on {}",
            clock(*at_ms),
            "🪫".bright_red(),
            bus_id.bright_red().bold(),
            colored_level(*level),
            route
        ),
        FleetEvent::LowBatteryDropped { bus_id, open_for, at_ms } => println!(
            "{} {} {} dropped, negotiation open for {}",
            clock(*at_ms),
            "⚠️ ".yellow(),
            bus_id,
            open_for
        ),
        FleetEvent::NegotiationOpened { negotiation_id, bus_id, candidates, can_postpone, at_ms } => println!(
            "{} {} #{} replace {}? candidates [{}]{}",
            clock(*at_ms),
            "🔁".bright_blue(),
            negotiation_id,
            bus_id.bright_red(),
            candidates.join(", ").bright_cyan(),
            if *can_postpone { "" } else { " (no more postponing)" }
        ),
        FleetEvent::ReplacementDecided { negotiation_id, bus_id, outcome, at_ms } => {
            let text = match outcome {
                ReplacementOutcome::Selected { candidate_id } => format!("{} dispatched", candidate_id).bright_green(),
                ReplacementOutcome::Postponed { reopen_at_ms, .. } => {
                    format!("postponed until {}", clock(*reopen_at_ms)).yellow()
                }
                ReplacementOutcome::Cancelled => "cancelled".bright_red(),
            };
            println!("{} {} #{} {} {}", clock(*at_ms), "🔁".bright_blue(), negotiation_id, bus_id, text);
        }
        FleetEvent::BusSkipped { bus_id, reason, at_ms } => println!(
            "{} {} {} skipped: {}",
            clock(*at_ms),
            "❗".bright_red(),
            bus_id,
            reason
        ),
        FleetEvent::TickCompleted { tick, clock_ms } => {
            if format != "compact" {
                println!("{} {}", clock(*clock_ms), format!("tick {}", tick).dimmed());
            }
        }
    }
}

fn clock(ms: u64) -> ColoredString {
    let minutes = ms / 60_000;
    format!("[{:02}:{:02}:{:02}]", minutes / 60, minutes % 60, (ms / 1000) % 60).dimmed()
}
