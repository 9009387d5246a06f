#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeframe {
    pub label: String,
    pub step_seconds: i64,
}

impl Timeframe {
    /// Parses bar widths such as `5m`, `15min`, `1h` or `1day` into a canonical
    /// label (`5m`, `15m`, `1h`, `1d`).
    pub fn parse(value: &str) -> Result<Self, String> {
        let step_seconds = parse_duration_like_seconds(value)?;
        if step_seconds <= 0 {
            return Err(format!("timeframe must be positive: {value}"));
        }
        if step_seconds % 60 != 0 {
            return Err(format!("timeframe must be a whole number of minutes: {value}"));
        }
        if 86_400 % step_seconds != 0 {
            return Err(format!("timeframe must divide a day evenly: {value}"));
        }
        Ok(Self {
            label: canonical_label(step_seconds),
            step_seconds,
        })
    }
}

fn canonical_label(step_seconds: i64) -> String {
    if step_seconds % 86_400 == 0 {
        format!("{}d", step_seconds / 86_400)
    } else if step_seconds % 3600 == 0 {
        format!("{}h", step_seconds / 3600)
    } else {
        format!("{}m", step_seconds / 60)
    }
}

pub fn parse_duration_like_seconds(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(seconds);
    }

    let (number_part, unit) = if let Some(stripped) = trimmed.strip_suffix("min") {
        (stripped, "min")
    } else if let Some(stripped) = trimmed.strip_suffix("hour") {
        (stripped, "hour")
    } else if let Some(stripped) = trimmed.strip_suffix("day") {
        (stripped, "day")
    } else {
        trimmed.split_at(trimmed.len().saturating_sub(1))
    };

    let multiplier = match unit {
        "s" => 1,
        "m" | "min" => 60,
        "h" | "hour" => 3600,
        "d" | "day" => 86400,
        _ => return Err(format!("unsupported duration unit: {unit}")),
    };

    let number: i64 = number_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    Ok(number * multiplier)
}
