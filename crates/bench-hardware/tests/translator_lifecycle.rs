//! Translators running on their worker threads against the mock instrument.

use bench_core::{instrument_registry, InstrumentValue};
use bench_hardware::{
    physical_registry, InstrumentConfiguration, InstrumentManager, MockInstrument,
    PhysicalInstrument, TranslatorConfiguration, TranslatorContext, TranslatorRegistry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn context() -> (TranslatorContext, Arc<MockInstrument>) {
    let mock = Arc::new(MockInstrument::new([
        ("current", json!(0.5)),
        ("voltage", json!(12.0)),
    ]));
    let physical = physical_registry();
    physical
        .register("psu", mock.clone() as Arc<dyn PhysicalInstrument>)
        .unwrap();
    (
        TranslatorContext {
            physical: Arc::new(physical),
            instruments: Arc::new(instrument_registry()),
            history_capacity: 16,
        },
        mock,
    )
}

fn polling(interval: f64) -> TranslatorConfiguration {
    serde_json::from_value(json!({
        "metadata": { "uid": "psu-poller", "name": "PSU poller" },
        "class": "PollingTranslator",
        "physical_instrument_uid": "psu",
        "getter_function": "read_all",
        "polling_interval": interval,
        "entities": [
            { "virtual_instrument": { "uid": "current", "unit": "A" } },
            {
                "virtual_instrument": { "uid": "voltage", "unit": "V" },
                "setter_function": "set",
                "setter_arguments": { "channel": "voltage" }
            },
        ],
    }))
    .unwrap()
}

#[test]
fn polling_translator_tracks_physical_changes() {
    let (context, mock) = context();
    let registry = TranslatorRegistry::with_builtin();
    let translator = registry.build(&polling(0.02), &context).unwrap();
    translator.start().unwrap();

    let voltage = context.instruments.get("voltage").unwrap();
    voltage
        .wait_for(
            |s| s.value == InstrumentValue::Float(12.0),
            Some(Duration::from_secs(2)),
        )
        .unwrap();

    // Command goes down to the mock; the next poll brings it back up.
    assert!(voltage.command(&InstrumentValue::Float(3.3)));
    assert_eq!(mock.channel("voltage"), Some(json!(3.3)));
    let state = voltage
        .wait_for(
            |s| s.value == InstrumentValue::Float(3.3),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
    assert!(state.sequence >= 1);

    translator.stop();
    assert!(!translator.is_running());
}

#[test]
fn stop_is_bounded_by_one_cycle() {
    let (context, _mock) = context();
    let translator = TranslatorRegistry::with_builtin()
        .build(&polling(5.0), &context)
        .unwrap();
    translator.start().unwrap();

    let current = context.instruments.get("current").unwrap();
    current
        .wait_for(|_| true, Some(Duration::from_secs(2)))
        .unwrap();

    // The worker is sleeping out a 5 s interval; stop must interrupt it.
    let start = Instant::now();
    translator.stop();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn broken_getter_does_not_kill_the_worker() {
    let (context, mock) = context();
    mock.set_failing(true);
    let translator = TranslatorRegistry::with_builtin()
        .build(&polling(0.01), &context)
        .unwrap();
    translator.start().unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(translator.is_running());

    mock.set_failing(false);
    let current = context.instruments.get("current").unwrap();
    current
        .wait_for(|_| true, Some(Duration::from_secs(2)))
        .unwrap();
    translator.stop();
}

#[test]
fn duplicate_output_uid_fails_second_translator() {
    let (context, _mock) = context();
    let registry = TranslatorRegistry::with_builtin();
    let _first = registry.build(&polling(1.0), &context).unwrap();

    let mut second = polling(1.0);
    second.metadata.uid = "other".into();
    let err = registry.build(&second, &context).unwrap_err();
    assert!(err.to_string().contains("already registered"));
    assert_eq!(context.instruments.len(), 2);
}

#[test]
fn manager_loads_yaml_configuration() {
    let yaml = r#"
name: Power rig
physical_instruments:
  - uid: psu
    class: MockInstrument
    arguments:
      channels:
        voltage: 24.0
translators:
  - metadata:
      uid: psu-poller
    class_name: PollingTranslator
    physical_instrument_uid: psu
    getter_function: read
    polling_interval: 0.02
    entities:
      - virtual_instrument:
          uid: supply-voltage
          unit: V
  - metadata:
      uid: psu-listener
    class: SubscriptionTranslator
    physical_instrument_uid: psu
    subscribe_function: on_update
    entities:
      - virtual_instrument:
          uid: supply-voltage-pushed
        extractor_field: voltage
"#;
    let configuration: InstrumentConfiguration = serde_yaml::from_str(yaml).unwrap();
    let manager = InstrumentManager::new(Arc::new(instrument_registry())).with_history_capacity(4);

    let summary = manager.load([&configuration]);
    assert_eq!(summary.translators, 2);
    manager.start_all();

    let polled = manager.instruments().get("supply-voltage").unwrap();
    assert_eq!(
        polled
            .wait_for(|_| true, Some(Duration::from_secs(2)))
            .unwrap()
            .value,
        InstrumentValue::Float(24.0)
    );

    let psu = manager.physical().get("psu").unwrap();
    psu.invoke("set", &[json!(30.0)], &Default::default()).unwrap();
    let pushed = manager.instruments().get("supply-voltage-pushed").unwrap();
    assert_eq!(pushed.value().unwrap(), InstrumentValue::Float(30.0));

    manager.stop_all();
    assert!(manager.instruments().is_empty());
}
