use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// --- Enregistrements bruts (import) ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityRecord {
    #[serde(default)]
    pub cve: Option<String>,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    // Une date illisible devient `None` plutôt que de faire échouer tout l'import.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub published: Option<DateTime<Utc>>,
    // Seuls les objets JSON sont retenus comme facteurs de risque.
    #[serde(default, deserialize_with = "object_or_none")]
    pub risk_factors: Option<Map<String, Value>>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
}

fn object_or_none<'de, D>(deserializer: D) -> Result<Option<Map<String, Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => Ok(Some(map)),
        _ => Ok(None),
    }
}

// Formats acceptés : RFC 3339, "YYYY-MM-DD HH:MM:SS" (UTC implicite), "YYYY-MM-DD".
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// --- Agrégat du dashboard ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

// Les quatre niveaux sont toujours sérialisés, à 0 s'ils sont absents du store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityBreakdown {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl SeverityBreakdown {
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut breakdown = Self::default();
        for (label, count) in counts {
            // Les libellés inconnus sont ignorés.
            let slot = match Severity::from_label(label.as_ref()) {
                Some(Severity::Critical) => &mut breakdown.critical,
                Some(Severity::High) => &mut breakdown.high,
                Some(Severity::Medium) => &mut breakdown.medium,
                Some(Severity::Low) => &mut breakdown.low,
                None => continue,
            };
            *slot += count;
        }
        breakdown
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixProgress {
    pub total: u64,
    pub fixed: u64,
}

impl FixProgress {
    // Arrondi à l'entier le plus proche, 0 quand il n'y a aucun enregistrement.
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let ratio = self.fixed.min(self.total) as f64 / self.total as f64;
        (ratio * 100.0).round() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskFactorCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    pub year: i32,
    pub month: u32,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total: u64,
    #[serde(rename = "affectedRepositories")]
    pub affected_resources: u64,
    pub fixed_percentage: u8,
    pub severity_breakdown: SeverityBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetadata {
    pub generated_at: DateTime<Utc>,
    pub timeline_months: u32,
    pub queries_executed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardAggregate {
    pub stats: DashboardStats,
    pub risk_factors: Vec<RiskFactorCount>,
    pub timeline: Vec<TimelineBucket>,
    pub metadata: AggregateMetadata,
}

// --- Requêtes / réponses HTTP ---

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub success: bool,
    pub message: String,
    pub deleted_keys: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerability_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}
