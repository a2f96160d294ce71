use crate::models::assessment::ScoreBreakdown;

pub const MAX_CREATIVITY_BONUS: u32 = 50;

pub fn base_points(level: u8) -> u32 {
    match level {
        1 => 100,
        2 => 200,
        3 => 150,
        4 => 200,
        5 => 300,
        _ => 0,
    }
}

pub fn attempt_multiplier(attempts: u32) -> f64 {
    match attempts {
        0 | 1 => 1.0,
        2 => 0.9,
        3 => 0.8,
        4 => 0.7,
        _ => 0.5,
    }
}

pub fn speed_bonus(elapsed_seconds: u64) -> u32 {
    match elapsed_seconds {
        0..=59 => 50,
        60..=119 => 30,
        120..=179 => 15,
        _ => 0,
    }
}

/// Points for a completed level.
pub fn calculate_score(
    level: u8,
    attempts: u32,
    elapsed_seconds: u64,
    creativity_score: u32,
) -> ScoreBreakdown {
    let base_points = base_points(level);
    let attempt_multiplier = attempt_multiplier(attempts);
    let creativity_bonus = creativity_score.min(MAX_CREATIVITY_BONUS);
    let speed_bonus = speed_bonus(elapsed_seconds);

    let raw = f64::from(base_points) * attempt_multiplier
        + f64::from(creativity_bonus)
        + f64::from(speed_bonus);

    ScoreBreakdown {
        base_points,
        attempt_multiplier,
        creativity_bonus,
        speed_bonus,
        final_score: raw.round() as u32,
    }
}
