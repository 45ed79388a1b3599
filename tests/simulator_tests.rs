use busfleet::protocol::*;
use busfleet::*;
use std::sync::{Arc, Mutex};

fn run(sim: &mut FleetSimulator, handler: &mut ProtocolHandler, line: &str) -> CommandResponse {
    let command = handler.parse_command(line).unwrap();
    sim.execute_command(command)
}

#[test]
fn test_demo_fleet_from_default_config() {
    let sim = FleetSimulator::new(SimulationConfig::default()).unwrap();
    assert_eq!(sim.registry().len(), 80);
    assert_eq!(sim.routes().len(), 8);
    assert!(!sim.is_running());

    let snapshot = sim.fleet_snapshot();
    assert_eq!(snapshot.counts.garage, 30);
    assert_eq!(snapshot.counts.inroute, 50);
    assert!(snapshot.negotiation.is_none());
}

#[test]
fn test_json_command_flow() {
    let mut sim = FleetSimulator::new(SimulationConfig::default()).unwrap();
    let mut handler = ProtocolHandler::new();

    let response = run(&mut sim, &mut handler, r#"{"id":1,"timestamp":0,"command_type":"Ping"}"#);
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.id, 1);

    let response = run(&mut sim, &mut handler, r#"{"id":2,"timestamp":0,"command_type":"Start"}"#);
    assert_eq!(response.status, ResponseStatus::Success);
    assert!(sim.is_running());

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":3,"timestamp":0,"command_type":{"SetWeather":{"month":"July","raining":true}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::Success);
    assert!((sim.weather().consumption_multiplier() - 0.9).abs() < 1e-9);

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":4,"timestamp":0,"command_type":{"Tick":{"count":5}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.data.as_ref().unwrap()["ticks"], 5);
    assert_eq!(sim.clock_ms(), 5_000);

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":5,"timestamp":0,"command_type":{"BusStatus":{"bus_id":"bus031"}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::Success);
    let bus: BusSnapshot = serde_json::from_value(response.data.unwrap()).unwrap();
    assert_eq!(bus.id, "BUS031");
    assert_eq!(bus.status, BusStatus::Inroute);
    assert!(bus.hours_until_reserve.is_some());

    let response = run(&mut sim, &mut handler, r#"{"id":6,"timestamp":0,"command_type":"FleetStatus"}"#);
    let json = handler.serialize_response(&response).unwrap();
    let snapshot: FleetSnapshot = serde_json::from_value(response.data.unwrap()).unwrap();
    assert_eq!(snapshot.buses.len(), 80);
    assert_eq!(snapshot.tick, 5);
    assert!(json.len() < MAX_RESPONSE_SIZE);
}

#[test]
fn test_admin_commands() {
    let mut sim = FleetSimulator::new(SimulationConfig::default()).unwrap();
    let mut handler = ProtocolHandler::new();

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":1,"timestamp":0,"command_type":{"AssignIntercept":{"bus_id":"BUS001","route":"R13"}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(sim.registry().get("BUS001").unwrap().status, BusStatus::Intercept);

    // Already dispatched
    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":2,"timestamp":0,"command_type":{"AssignIntercept":{"bus_id":"BUS001","route":"R13"}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::Rejected);

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":3,"timestamp":0,"command_type":{"SetBusStatus":{"bus_id":"BUS002","status":"Repair"}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(sim.registry().get("BUS002").unwrap().status, BusStatus::Repair);

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":4,"timestamp":0,"command_type":{"SetBatteryLevel":{"bus_id":"BUS003","level":150.0}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::InvalidCommand);
    assert_eq!(sim.registry().get("BUS003").unwrap().battery_level, 100.0);

    let response = run(
        &mut sim,
        &mut handler,
        r#"{"id":5,"timestamp":0,"command_type":{"SetTickRate":{"seconds_per_tick":0}}}"#,
    );
    assert_eq!(response.status, ResponseStatus::InvalidCommand);

    let response = run(&mut sim, &mut handler, r#"{"id":6,"timestamp":0,"command_type":"CancelReplacement"}"#);
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.message.as_deref(), Some("nothing to cancel"));
}

#[test]
fn test_observer_sees_tick_events() {
    let registry = FleetRegistry::from_buses([
        Bus::new("A", BusModel::BydK9)
            .with_status(BusStatus::Inroute)
            .with_route(RouteName::R10)
            .with_battery_level(29.0),
        Bus::new("B", BusModel::BydK9).with_battery_level(90.0),
    ]);
    let mut sim = FleetSimulator::with_fleet(
        SimulationConfig::default(),
        registry,
        busfleet::fleet::route::default_routes(),
    )
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sim.subscribe(move |event: &FleetEvent| sink.lock().unwrap().push(event.clone()));

    assert!(sim.tick().unwrap().is_none());
    assert!(seen.lock().unwrap().is_empty());

    sim.start();
    sim.tick().unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|e| matches!(e, FleetEvent::LowBatteryCrossed { bus_id, .. } if bus_id == "A")));
    assert!(seen.iter().any(|e| matches!(e, FleetEvent::NegotiationOpened { bus_id, .. } if bus_id == "A")));
    assert!(matches!(seen.last(), Some(FleetEvent::TickCompleted { tick: 1, clock_ms: 1000 })));

    // History keeps the notable ones only
    assert!(sim
        .event_history()
        .iter()
        .all(|r| !matches!(r.event, FleetEvent::BatteryLevelChanged { .. } | FleetEvent::TickCompleted { .. })));
}

#[test]
fn test_fleet_file_loading() {
    let dir = std::env::temp_dir().join(format!("busfleet-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let fleet_path = dir.join("fleet.txt");
    std::fs::write(
        &fleet_path,
        "BUS100;2021;R10;64.5;Inroute;0;BYDK9\n\
         BUS101;2022;R99;abc;Parked;x;Unknown\n\
         BUS102;2020\n",
    )
    .unwrap();

    let config = SimulationConfig {
        fleet_file: Some(fleet_path.to_string_lossy().into_owned()),
        ..SimulationConfig::default()
    };
    let sim = FleetSimulator::new(config).unwrap();

    assert_eq!(sim.registry().len(), 2);
    let repaired = sim.registry().get("BUS101").unwrap();
    assert_eq!(repaired.status, BusStatus::Garage);
    assert_eq!(repaired.route, RouteName::None);
    assert_eq!(repaired.model, BusModel::MbECitaro);
    assert_eq!(repaired.battery_level, 0.0);

    let missing = SimulationConfig {
        fleet_file: Some(dir.join("missing.txt").to_string_lossy().into_owned()),
        ..SimulationConfig::default()
    };
    assert!(matches!(FleetSimulator::new(missing), Err(SimulatorError::Config(_))));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_invalid_config_rejected_for_existing_fleet() {
    let config = SimulationConfig {
        charge_power_kw: -50.0,
        ..SimulationConfig::default()
    };
    let result = FleetSimulator::with_fleet(
        config,
        FleetRegistry::new(),
        busfleet::fleet::route::default_routes(),
    );
    assert!(matches!(result, Err(SimulatorError::Config(_))));
}
