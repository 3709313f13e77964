use chrono::NaiveTime;

/// Business-rule parameters. Every temporal policy the engine applies is an
/// explicit field here — in particular the sanction window, which is passed
/// per triggering event rather than read from a hidden constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Default sanction window in days for no-show closes.
    pub sanction_days: i64,
    /// Minimum days of notice required to cancel a reservation.
    pub cancel_days: i64,
    /// Fixed institutional slot length.
    pub slot_minutes: i64,
    /// Operating hours: slots must fall within [open_time, close_time].
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    /// Max reservations per participant per day in open rooms
    /// (existing active + requested, counted across the whole batch).
    pub daily_cap: u32,
    /// Max active reservations per participant per ISO week in open rooms.
    pub weekly_cap: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sanction_days: 60,
            cancel_days: 2,
            slot_minutes: 120,
            open_time: NaiveTime::from_hms_opt(8, 0, 0).expect("valid opening time"),
            close_time: NaiveTime::from_hms_opt(23, 0, 0).expect("valid closing time"),
            daily_cap: 2,
            weekly_cap: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Read overrides from `AULA_*` environment variables, falling back to
    /// the defaults above.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sanction_days: env_parse("AULA_SANCTION_DAYS", defaults.sanction_days),
            cancel_days: env_parse("AULA_CANCEL_DAYS", defaults.cancel_days),
            slot_minutes: env_parse("AULA_SLOT_MINUTES", defaults.slot_minutes),
            open_time: std::env::var("AULA_OPEN_TIME")
                .ok()
                .and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M").ok())
                .unwrap_or(defaults.open_time),
            close_time: std::env::var("AULA_CLOSE_TIME")
                .ok()
                .and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M").ok())
                .unwrap_or(defaults.close_time),
            daily_cap: env_parse("AULA_DAILY_CAP", defaults.daily_cap),
            weekly_cap: env_parse("AULA_WEEKLY_CAP", defaults.weekly_cap),
        }
    }
}
