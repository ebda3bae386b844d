//! Command line parsing for the headless player.

use journey_core::JourneyRef;
use uuid::Uuid;

/// What to play.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerArgs {
    pub journey: JourneyRef,
    pub start_at_ms: f64,
    pub profile_pictures: bool,
}

/// Parse `--uid --jwt --duration [--session] [--start-at] [--no-pictures]`.
///
/// Without `--session` a fresh session uid is generated.
pub fn parse_args(args: &[String]) -> Result<PlayerArgs, String> {
    let mut uid = None;
    let mut jwt = None;
    let mut session = None;
    let mut duration = None;
    let mut start_at_ms = 0.0;
    let mut profile_pictures = true;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--uid" => {
                uid = value.cloned();
                i += 1;
            }
            "--jwt" => {
                jwt = value.cloned();
                i += 1;
            }
            "--session" => {
                session = value.cloned();
                i += 1;
            }
            "--duration" => {
                duration = Some(parse_number("--duration", value)?);
                i += 1;
            }
            "--start-at" => {
                start_at_ms = parse_number("--start-at", value)?;
                i += 1;
            }
            "--no-pictures" => profile_pictures = false,
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    let duration = duration.ok_or("missing --duration")?;
    if duration <= 0.0 {
        return Err(format!("--duration must be positive, got {duration}"));
    }
    Ok(PlayerArgs {
        journey: JourneyRef::new(
            uid.ok_or("missing --uid")?,
            jwt.ok_or("missing --jwt")?,
            session.unwrap_or_else(|| Uuid::new_v4().to_string()),
            duration,
        ),
        start_at_ms,
        profile_pictures,
    })
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<f64, String> {
    let value = value.ok_or_else(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag} expects a number, got {value}"))
}
