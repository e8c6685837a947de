use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use atc_dialogue::config::EngineConfig;
use atc_dialogue::frequency::FrequencyTable;
use atc_dialogue::llm::{LlmConfig, LlmIntentClassifier, LlmProvider, LlmResponder, create_provider};
use atc_dialogue::role::ControllerRole;
use atc_dialogue::rules::RulePackStore;
use atc_dialogue::session::{FlightContext, SessionController, SessionHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env()?;

    let store = match &config.rule_pack_dir {
        Some(dir) => RulePackStore::load_dir(dir)?,
        None => RulePackStore::builtin()?,
    };
    let store = Arc::new(store);

    let flight = flight_from_env();

    eprintln!("ATC dialogue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Rule pack: {}", store.version().unwrap_or("unversioned"));
    eprintln!("   Callsign: {}", flight.callsign);
    if let (Some(origin), Some(destination)) = (&flight.origin, &flight.destination) {
        eprintln!("   Route: {} -> {}", origin, destination);
    }

    let mut controller = SessionController::new(Arc::clone(&store), config.clone());

    if let Some(path) = &config.frequency_table {
        let table = FrequencyTable::load(path)?;
        eprintln!("   Frequencies: {} airports", table.len());
        controller = controller.with_frequency_resolver(Arc::new(table));
    }

    if let Some(llm_config) = LlmConfig::from_env()? {
        let llm = create_provider(&llm_config)?;
        eprintln!("   LLM fallback: {}", llm.model_name());
        controller = controller
            .with_fallback_classifier(Arc::new(LlmIntentClassifier::new(Arc::clone(&llm))))
            .with_response_generator(Arc::new(LlmResponder::new(llm)));
    } else {
        eprintln!("   LLM fallback: disabled (set ATC_LLM_API_KEY to enable)");
    }

    eprintln!("   Type a transmission and press Enter. /state to inspect, /quit to exit.\n");

    let session = SessionHandle::spawn(controller, flight);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("PILOT> ");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/state" => {
                let (state, flight) = session.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
                println!("{}", serde_json::to_string_pretty(&flight)?);
            }
            transmission => match session.transmit(transmission).await {
                Ok(Some(turn)) => {
                    println!("{}> {}", turn.role.spoken_name().to_uppercase(), turn.text);
                    if turn.readback_required && !turn.readback_items.is_empty() {
                        eprintln!("   (readback: {})", turn.readback_items.join(", "));
                    }
                }
                Ok(None) => eprintln!("   (no response)"),
                Err(e) => tracing::error!(error = %e, "Turn failed"),
            },
        }
        eprint!("PILOT> ");
    }

    Ok(())
}

/// Flight plan from `ATC_*` environment variables.
fn flight_from_env() -> FlightContext {
    let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    FlightContext {
        origin: var("ATC_ORIGIN").map(|v| v.to_uppercase()),
        destination: var("ATC_DESTINATION").map(|v| v.to_uppercase()),
        runway: var("ATC_RUNWAY"),
        arrival_runway: var("ATC_ARRIVAL_RUNWAY"),
        sid: var("ATC_SID"),
        initial_climb: var("ATC_INITIAL_CLIMB"),
        cruise_level: var("ATC_CRUISE_LEVEL"),
        squawk: var("ATC_SQUAWK"),
        atis: var("ATC_ATIS"),
        aircraft_type: var("ATC_AIRCRAFT_TYPE"),
        current_unit: var("ATC_START_UNIT").and_then(|v| v.parse::<ControllerRole>().ok()),
        ..FlightContext::new(var("ATC_CALLSIGN").unwrap_or_else(|| "TEST 123".to_string()))
    }
}
