// =============================================================================
// Time-of-Day Scheduler — window + holiday + cooldown gating
// =============================================================================
//
// Windows are `{name, days, start HH:MM, end HH:MM}` in a configured IANA
// timezone; days use ISO weekday numbers (Mon=1 .. Sun=7).  Cross-midnight
// windows (`end < start`) attribute the pre-midnight portion to the window's
// weekday and the post-midnight portion to the previous weekday.  On overlap
// the first window in declaration order wins.
//
// Holidays block trading even while a window is open.  Cooldowns suppress
// trading for a configured number of minutes after an open (and are reported
// after a close).
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{SchedulerConfig, WindowConfig};

#[derive(Debug, Clone)]
struct Window {
    name: String,
    days: Vec<u8>,
    start: NaiveTime,
    end: NaiveTime,
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (hh, mm) = s.split_once(':')?;
    NaiveTime::from_hms_opt(hh.trim().parse().ok()?, mm.trim().parse().ok()?, 0)
}

fn parse_windows(windows: &[WindowConfig]) -> Vec<Window> {
    let mut parsed = Vec::new();
    for w in windows {
        match (parse_hhmm(&w.start), parse_hhmm(&w.end)) {
            (Some(start), Some(end)) => parsed.push(Window {
                name: w.name.clone(),
                days: w.days.iter().map(|&d| d as u8).collect(),
                start,
                end,
            }),
            _ => warn!(window = %w.name, "skipping window with unparsable HH:MM"),
        }
    }
    parsed
}

struct Inner {
    tz: Tz,
    windows: Vec<Window>,
    cool_open_minutes: f64,
    cool_close_minutes: f64,
    block_in_cooldown: bool,
    holidays: HashSet<String>,
    /// Per-symbol window overrides; an entry replaces the global windows for
    /// that symbol entirely.
    symbol_overrides: HashMap<String, Vec<Window>>,
}

/// Answers "may we quote right now" from wall-clock windows, holidays and
/// open/close cooldowns.
pub struct TimeOfDayScheduler {
    inner: RwLock<Inner>,
}

impl TimeOfDayScheduler {
    pub fn new(cfg: &SchedulerConfig) -> Self {
        let tz: Tz = cfg.tz.parse().unwrap_or(chrono_tz::UTC);
        Self {
            inner: RwLock::new(Inner {
                tz,
                windows: parse_windows(&cfg.windows),
                cool_open_minutes: cfg.cooldown_open_minutes.max(0.0),
                cool_close_minutes: cfg.cooldown_close_minutes.max(0.0),
                block_in_cooldown: cfg.block_in_cooldown,
                holidays: cfg.holidays.iter().cloned().collect(),
                symbol_overrides: HashMap::new(),
            }),
        }
    }

    /// Replace windows, timezone and cooldown parameters in one shot (the
    /// `/admin/scheduler/apply` hot reload). An unparsable timezone keeps the
    /// previous one.
    pub fn apply(&self, cfg: &SchedulerConfig) {
        let mut inner = self.inner.write();
        match cfg.tz.parse::<Tz>() {
            Ok(tz) => inner.tz = tz,
            Err(_) => warn!(tz = %cfg.tz, "unknown timezone, keeping previous"),
        }
        inner.windows = parse_windows(&cfg.windows);
        inner.cool_open_minutes = cfg.cooldown_open_minutes.max(0.0);
        inner.cool_close_minutes = cfg.cooldown_close_minutes.max(0.0);
        inner.block_in_cooldown = cfg.block_in_cooldown;
        inner.holidays = cfg.holidays.iter().cloned().collect();
        info!(windows = inner.windows.len(), tz = %inner.tz, "scheduler windows applied");
    }

    pub fn set_symbol_windows(&self, symbol: &str, windows: &[WindowConfig]) {
        let mut inner = self.inner.write();
        if windows.is_empty() {
            inner.symbol_overrides.remove(symbol);
        } else {
            inner
                .symbol_overrides
                .insert(symbol.to_string(), parse_windows(windows));
        }
    }

    pub fn set_holidays(&self, dates: &[String]) {
        self.inner.write().holidays = dates.iter().cloned().collect();
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Name of the first (declaration order) open window, if any.
    pub fn current_window(&self, now: DateTime<Utc>) -> Option<String> {
        let inner = self.inner.read();
        Self::match_window(&inner.windows, inner.tz, now).map(|w| w.name.clone())
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.current_window(now).is_some()
    }

    /// Trading gate: open, not a holiday, and not inside a blocking
    /// open-cooldown.
    pub fn is_trade_allowed(&self, now: DateTime<Utc>) -> bool {
        if !self.is_open(now) {
            return false;
        }
        if self.is_holiday(now) {
            return false;
        }
        let block = self.inner.read().block_in_cooldown;
        if block && self.in_cooldown_open(now) {
            return false;
        }
        true
    }

    /// Per-symbol gate: same as [`is_trade_allowed`] but a symbol with window
    /// overrides is judged against those windows instead.
    pub fn is_trade_allowed_for(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let has_override = {
            let inner = self.inner.read();
            match inner.symbol_overrides.get(symbol) {
                Some(windows) => {
                    if Self::match_window(windows, inner.tz, now).is_none() {
                        return false;
                    }
                    true
                }
                None => false,
            }
        };
        if has_override {
            // The override decided the window question; holidays and
            // cooldowns still apply globally.
            if self.is_holiday(now) {
                return false;
            }
            let block = self.inner.read().block_in_cooldown;
            return !(block && self.in_cooldown_open(now));
        }
        self.is_trade_allowed(now)
    }

    pub fn is_holiday(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read();
        let local = now.with_timezone(&inner.tz);
        let key = format!(
            "{:04}-{:02}-{:02}",
            local.year(),
            local.month(),
            local.day()
        );
        inner.holidays.contains(&key)
    }

    pub fn in_cooldown_open(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read();
        if inner.cool_open_minutes <= 0.0 {
            return false;
        }
        if Self::match_window(&inner.windows, inner.tz, now).is_none() {
            return false;
        }
        match Self::last_transition(&inner, now) {
            Some(last) => {
                let delta = now.with_timezone(&inner.tz) - last;
                (delta.num_milliseconds() as f64) < inner.cool_open_minutes * 60_000.0
            }
            None => false,
        }
    }

    pub fn in_cooldown_close(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read();
        if inner.cool_close_minutes <= 0.0 {
            return false;
        }
        if Self::match_window(&inner.windows, inner.tz, now).is_some() {
            return false;
        }
        match Self::last_transition(&inner, now) {
            Some(last) => {
                let delta = now.with_timezone(&inner.tz) - last;
                (delta.num_milliseconds() as f64) < inner.cool_close_minutes * 60_000.0
            }
            None => false,
        }
    }

    /// Next window boundary (open or close) after `now`, if any within the
    /// coming day.
    pub fn next_change(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let inner = self.inner.read();
        let local_now = now.with_timezone(&inner.tz);
        let mut candidates: Vec<DateTime<Tz>> = Vec::new();

        for off in 0..=1i64 {
            let day = local_now.date_naive() + Duration::days(off);
            let iso_day = Self::shifted_weekday(local_now.weekday().number_from_monday() as u8, off);
            let prev_iso = Self::prev_weekday(iso_day);
            for w in &inner.windows {
                let st = Self::combine(inner.tz, day, w.start);
                let en = Self::combine(inner.tz, day, w.end);
                if w.start <= w.end {
                    if w.days.contains(&iso_day) {
                        if let Some(st) = st {
                            if st > local_now {
                                candidates.push(st);
                            }
                        }
                        if let Some(en) = en {
                            if en > local_now {
                                candidates.push(en);
                            }
                        }
                    }
                } else {
                    if w.days.contains(&iso_day) {
                        if let Some(st) = st {
                            if st > local_now {
                                candidates.push(st);
                            }
                        }
                    }
                    if w.days.contains(&prev_iso) {
                        if let Some(en) = en {
                            if en > local_now {
                                candidates.push(en);
                            }
                        }
                    }
                }
            }
        }

        candidates
            .into_iter()
            .min()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn status(&self, now: DateTime<Utc>) -> serde_json::Value {
        let window = self.current_window(now);
        serde_json::json!({
            "is_open": window.is_some(),
            "current_window": window,
            "is_trade_allowed": self.is_trade_allowed(now),
            "in_cooldown_open": self.in_cooldown_open(now),
            "in_cooldown_close": self.in_cooldown_close(now),
            "next_change": self
                .next_change(now)
                .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn combine(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
        use chrono::TimeZone;
        tz.from_local_datetime(&NaiveDateTime::new(date, time))
            .earliest()
    }

    fn prev_weekday(iso_day: u8) -> u8 {
        ((iso_day + 5) % 7) + 1
    }

    fn shifted_weekday(iso_day: u8, off: i64) -> u8 {
        let shifted = (iso_day as i64 - 1 + off).rem_euclid(7);
        (shifted + 1) as u8
    }

    fn match_window<'a>(windows: &'a [Window], tz: Tz, now: DateTime<Utc>) -> Option<&'a Window> {
        let local = now.with_timezone(&tz);
        let t = local.time();
        let iso_day = local.weekday().number_from_monday() as u8;
        let prev_day = Self::prev_weekday(iso_day);

        windows
            .iter()
            .find(|w| Self::window_open(w, iso_day, prev_day, t))
    }

    fn window_open(w: &Window, iso_day: u8, prev_day: u8, t: NaiveTime) -> bool {
        if w.start <= w.end {
            return w.days.contains(&iso_day) && w.start <= t && t < w.end;
        }
        // Cross-midnight window, e.g. 22:00 → 02:00.
        if t >= w.start {
            w.days.contains(&iso_day)
        } else if t < w.end {
            w.days.contains(&prev_day)
        } else {
            false
        }
    }

    /// Most recent window boundary at or before `now`.
    fn last_transition(inner: &Inner, now: DateTime<Utc>) -> Option<DateTime<Tz>> {
        let local_now = now.with_timezone(&inner.tz);
        let mut candidates: Vec<DateTime<Tz>> = Vec::new();

        for off in -1..=0i64 {
            let day = local_now.date_naive() + Duration::days(off);
            let iso_day = Self::shifted_weekday(local_now.weekday().number_from_monday() as u8, off);
            for w in &inner.windows {
                if !w.days.contains(&iso_day) {
                    continue;
                }
                let st = Self::combine(inner.tz, day, w.start);
                let en = Self::combine(inner.tz, day, w.end);
                if w.start <= w.end {
                    for cand in [st, en].into_iter().flatten() {
                        if cand <= local_now {
                            candidates.push(cand);
                        }
                    }
                } else {
                    if let Some(st) = st {
                        if st <= local_now {
                            candidates.push(st);
                        }
                    }
                    let en_prev = Self::combine(inner.tz, day - Duration::days(1), w.end);
                    if let Some(en_prev) = en_prev {
                        if en_prev <= local_now {
                            candidates.push(en_prev);
                        }
                    }
                }
            }
        }

        candidates.into_iter().max()
    }
}

impl std::fmt::Debug for TimeOfDayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TimeOfDayScheduler")
            .field("tz", &inner.tz)
            .field("windows", &inner.windows.len())
            .finish()
    }
}

// =============================================================================
// Window suggestion ranker
// =============================================================================

/// Aggregated quality stats for one "HH:MM-HH:MM" hour bucket.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BucketStats {
    #[serde(default)]
    pub median_spread_bps: f64,
    #[serde(default)]
    pub vola_ewma: f64,
    #[serde(default)]
    pub volume_norm: f64,
    #[serde(default)]
    pub sample: u64,
}

/// Ranker configuration for [`suggest_windows`].
#[derive(Debug, Clone, Deserialize)]
pub struct SuggestConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_top_k() -> usize {
    6
}

fn default_min_sample() -> u64 {
    200
}

fn default_mode() -> String {
    "neutral".to_string()
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_sample: default_min_sample(),
            mode: default_mode(),
        }
    }
}

/// One suggested window with its quality score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SuggestedWindow {
    pub start: String,
    pub end: String,
    pub score: f64,
}

/// Deterministic top-k ranking of hour buckets. Lower spread and volatility
/// score higher, higher volume scores higher; weights depend on the mode.
/// Ties break lexicographically on the bucket key so the output is
/// byte-stable.
pub fn suggest_windows(
    stats: &BTreeMap<String, BucketStats>,
    cfg: &SuggestConfig,
) -> Vec<SuggestedWindow> {
    let (w_spread, w_vola, w_vol) = match cfg.mode.to_lowercase().as_str() {
        "conservative" => (0.5, 0.3, 0.2),
        "aggressive" => (0.2, 0.2, 0.6),
        _ => (0.35, 0.25, 0.40),
    };

    let mut candidates: Vec<(f64, String, SuggestedWindow)> = Vec::new();
    for (key, d) in stats {
        if d.sample < cfg.min_sample {
            continue;
        }
        let Some((start, end)) = key.split_once('-') else {
            continue;
        };
        let spread = d.median_spread_bps.max(0.0);
        let vola = d.vola_ewma.max(0.0);
        let vol = d.volume_norm.max(0.0);
        let s_norm = 1.0 - (spread / 50.0).min(1.0);
        let v_norm = 1.0 - (vola / 100.0).min(1.0);
        let vol_norm = vol.min(1.0);
        let score = w_spread * s_norm + w_vola * v_norm + w_vol * vol_norm;
        candidates.push((
            score,
            key.clone(),
            SuggestedWindow {
                start: start.to_string(),
                end: end.to_string(),
                score,
            },
        ));
    }

    candidates.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    candidates
        .into_iter()
        .take(cfg.top_k)
        .map(|(_, _, w)| w)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sched(windows: Vec<WindowConfig>) -> TimeOfDayScheduler {
        TimeOfDayScheduler::new(&SchedulerConfig {
            tz: "UTC".to_string(),
            windows,
            holidays: Vec::new(),
            cooldown_open_minutes: 0.0,
            cooldown_close_minutes: 0.0,
            block_in_cooldown: true,
        })
    }

    fn win(name: &str, days: Vec<u8>, start: &str, end: &str) -> WindowConfig {
        WindowConfig {
            name: name.to_string(),
            days,
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn cross_midnight_window_attribution() {
        // Mon–Fri 22:00 → 02:00. 2025-01-06 is a Monday.
        let s = sched(vec![win("late", vec![1, 2, 3, 4, 5], "22:00", "02:00")]);
        assert!(s.is_open(utc(2025, 1, 6, 23, 0))); // Mon 23:00
        assert!(s.is_open(utc(2025, 1, 7, 1, 0))); // Tue 01:00 (Mon's window)
        assert!(!s.is_open(utc(2025, 1, 7, 3, 0))); // Tue 03:00
    }

    #[test]
    fn saturday_night_spillover_needs_friday() {
        // Fri-only 22:00 → 02:00 covers Sat 01:00 but not Sat 03:00.
        let s = sched(vec![win("fri", vec![5], "22:00", "02:00")]);
        assert!(s.is_open(utc(2025, 1, 10, 23, 30))); // Fri night
        assert!(s.is_open(utc(2025, 1, 11, 1, 30))); // Sat early morning
        assert!(!s.is_open(utc(2025, 1, 11, 22, 30))); // Sat night not in days
    }

    #[test]
    fn overlap_first_declared_wins() {
        let s = sched(vec![
            win("a", vec![1, 2, 3, 4, 5], "08:00", "12:00"),
            win("b", vec![1, 2, 3, 4, 5], "09:00", "13:00"),
        ]);
        assert_eq!(
            s.current_window(utc(2025, 1, 6, 10, 0)).as_deref(),
            Some("a")
        );
        assert_eq!(
            s.current_window(utc(2025, 1, 6, 12, 30)).as_deref(),
            Some("b")
        );
    }

    #[test]
    fn holiday_blocks_trading_while_open() {
        let s = sched(vec![win("all", vec![1, 2, 3, 4, 5, 6, 7], "00:00", "23:59")]);
        s.set_holidays(&["2025-01-06".to_string()]);
        let t = utc(2025, 1, 6, 9, 0);
        assert!(s.is_open(t));
        assert!(!s.is_trade_allowed(t));
        // The day after is fine.
        assert!(s.is_trade_allowed(utc(2025, 1, 7, 9, 0)));
    }

    #[test]
    fn open_cooldown_blocks_trading() {
        let s = TimeOfDayScheduler::new(&SchedulerConfig {
            tz: "UTC".to_string(),
            windows: vec![win("eu", vec![1, 2, 3, 4, 5], "08:00", "12:00")],
            holidays: Vec::new(),
            cooldown_open_minutes: 15.0,
            cooldown_close_minutes: 0.0,
            block_in_cooldown: true,
        });
        // 5 minutes after Monday open: open but still cooling down.
        let t = utc(2025, 1, 6, 8, 5);
        assert!(s.is_open(t));
        assert!(s.in_cooldown_open(t));
        assert!(!s.is_trade_allowed(t));
        // 20 minutes after open: trading allowed.
        let t2 = utc(2025, 1, 6, 8, 20);
        assert!(!s.in_cooldown_open(t2));
        assert!(s.is_trade_allowed(t2));
    }

    #[test]
    fn close_cooldown_reported_after_close() {
        let s = TimeOfDayScheduler::new(&SchedulerConfig {
            tz: "UTC".to_string(),
            windows: vec![win("eu", vec![1, 2, 3, 4, 5], "08:00", "12:00")],
            holidays: Vec::new(),
            cooldown_open_minutes: 0.0,
            cooldown_close_minutes: 30.0,
            block_in_cooldown: true,
        });
        assert!(s.in_cooldown_close(utc(2025, 1, 6, 12, 10)));
        assert!(!s.in_cooldown_close(utc(2025, 1, 6, 13, 10)));
    }

    #[test]
    fn next_change_picks_nearest_boundary() {
        let s = sched(vec![win("eu", vec![1, 2, 3, 4, 5], "08:00", "12:00")]);
        let nxt = s.next_change(utc(2025, 1, 6, 7, 0)).unwrap();
        assert_eq!(nxt, utc(2025, 1, 6, 8, 0));
        let nxt2 = s.next_change(utc(2025, 1, 6, 9, 0)).unwrap();
        assert_eq!(nxt2, utc(2025, 1, 6, 12, 0));
    }

    #[test]
    fn timezone_shifts_window() {
        let s = TimeOfDayScheduler::new(&SchedulerConfig {
            tz: "Europe/Berlin".to_string(),
            windows: vec![win("eu", vec![1, 2, 3, 4, 5], "09:00", "17:00")],
            holidays: Vec::new(),
            cooldown_open_minutes: 0.0,
            cooldown_close_minutes: 0.0,
            block_in_cooldown: true,
        });
        // 08:30 UTC in January is 09:30 Berlin (CET): open.
        assert!(s.is_open(utc(2025, 1, 6, 8, 30)));
        // 07:30 UTC is 08:30 Berlin: closed.
        assert!(!s.is_open(utc(2025, 1, 6, 7, 30)));
        // In July (CEST, UTC+2) 07:30 UTC is 09:30 Berlin: open.
        assert!(s.is_open(utc(2025, 7, 7, 7, 30)));
    }

    #[test]
    fn symbol_override_replaces_global_windows() {
        let s = sched(vec![win("eu", vec![1, 2, 3, 4, 5], "08:00", "12:00")]);
        s.set_symbol_windows(
            "ETHUSDT",
            &[win("eth", vec![1, 2, 3, 4, 5], "14:00", "16:00")],
        );
        let morning = utc(2025, 1, 6, 9, 0);
        let afternoon = utc(2025, 1, 6, 15, 0);
        assert!(s.is_trade_allowed_for("BTCUSDT", morning));
        assert!(!s.is_trade_allowed_for("ETHUSDT", morning));
        assert!(!s.is_trade_allowed_for("BTCUSDT", afternoon));
        assert!(s.is_trade_allowed_for("ETHUSDT", afternoon));
    }

    #[test]
    fn suggest_ranks_and_breaks_ties_by_key() {
        let mut stats = BTreeMap::new();
        stats.insert(
            "08:00-09:00".to_string(),
            BucketStats {
                median_spread_bps: 10.0,
                vola_ewma: 20.0,
                volume_norm: 0.9,
                sample: 500,
            },
        );
        stats.insert(
            "09:00-10:00".to_string(),
            BucketStats {
                median_spread_bps: 10.0,
                vola_ewma: 20.0,
                volume_norm: 0.9,
                sample: 500,
            },
        );
        stats.insert(
            "10:00-11:00".to_string(),
            BucketStats {
                median_spread_bps: 45.0,
                vola_ewma: 90.0,
                volume_norm: 0.1,
                sample: 500,
            },
        );
        stats.insert(
            "11:00-12:00".to_string(),
            BucketStats {
                sample: 10, // below min_sample, dropped
                ..BucketStats::default()
            },
        );

        let out = suggest_windows(&stats, &SuggestConfig::default());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].start, "08:00");
        assert_eq!(out[1].start, "09:00");
        assert_eq!(out[2].start, "10:00");
        assert!(out[0].score > out[2].score);

        // Determinism: same input, same output.
        let out2 = suggest_windows(&stats, &SuggestConfig::default());
        assert_eq!(out, out2);
    }

    #[test]
    fn suggest_mode_weights_differ() {
        let mut stats = BTreeMap::new();
        // Tight spread, low volume.
        stats.insert(
            "08:00-09:00".to_string(),
            BucketStats {
                median_spread_bps: 1.0,
                vola_ewma: 10.0,
                volume_norm: 0.1,
                sample: 500,
            },
        );
        // Wide spread, huge volume.
        stats.insert(
            "09:00-10:00".to_string(),
            BucketStats {
                median_spread_bps: 40.0,
                vola_ewma: 10.0,
                volume_norm: 1.0,
                sample: 500,
            },
        );

        let conservative = suggest_windows(
            &stats,
            &SuggestConfig {
                mode: "conservative".to_string(),
                ..SuggestConfig::default()
            },
        );
        let aggressive = suggest_windows(
            &stats,
            &SuggestConfig {
                mode: "aggressive".to_string(),
                ..SuggestConfig::default()
            },
        );
        assert_eq!(conservative[0].start, "08:00");
        assert_eq!(aggressive[0].start, "09:00");
    }
}
