// Test fixtures and data generators for integration tests

use churnline::types::{FEATURE_COLUMNS, FEATURE_COUNT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::path::Path;

const STATES: [&str; 6] = ["KS", "OH", "NJ", "OK", "AL", "MA"];

/// Deterministic generator of churn datasets shaped like the telecom export
pub struct ChurnDataGenerator {
    rng: StdRng,
}

impl ChurnDataGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// CSV with a header, a text `state` column, the features, the charge
    /// columns and a 0/1 `churn` label
    pub fn csv(&mut self, rows: usize) -> String {
        let mut out = String::from(
            "state,account_length,international_plan,voice_mail_plan,number_vmail_messages,\
             total_day_calls,total_eve_calls,total_night_calls,total_intl_calls,\
             number_customer_service_calls,area_code_encoded,total_day_minutes,\
             total_eve_minutes,total_night_minutes,total_intl_minutes,\
             total_day_charge,total_eve_charge,total_night_charge,total_intl_charge,churn\n",
        );

        for _ in 0..rows {
            let state = STATES[self.rng.gen_range(0..STATES.len())];
            let account_length = self.rng.gen_range(1..240);
            let intl_plan = u8::from(self.rng.gen_bool(0.1));
            let vm_plan = u8::from(self.rng.gen_bool(0.3));
            let vmail = if vm_plan == 1 { self.rng.gen_range(5..50) } else { 0 };
            let day_calls = self.rng.gen_range(50..160);
            let eve_calls = self.rng.gen_range(50..160);
            let night_calls = self.rng.gen_range(50..160);
            let intl_calls = self.rng.gen_range(0..20);
            let service_calls = self.rng.gen_range(0..9);
            let area_code = self.rng.gen_range(0..3);
            let day_min: f64 = self.rng.gen_range(0.0..350.0);
            let eve_min: f64 = self.rng.gen_range(0.0..350.0);
            let night_min: f64 = self.rng.gen_range(0.0..350.0);
            let intl_min: f64 = self.rng.gen_range(0.0..20.0);

            let risk = 0.12 * service_calls as f64
                + 0.35 * intl_plan as f64
                + day_min / 700.0
                - 0.2 * vm_plan as f64;
            let churn = u8::from(risk + self.rng.gen_range(-0.15..0.15) > 0.6);

            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},",
                state,
                account_length,
                intl_plan,
                vm_plan,
                vmail,
                day_calls,
                eve_calls,
                night_calls,
                intl_calls,
                service_calls,
                area_code
            ));
            out.push_str(&format!(
                "{:.1},{:.1},{:.1},{:.1},{:.2},{:.2},{:.2},{:.2},{}\n",
                day_min,
                eve_min,
                night_min,
                intl_min,
                day_min * 0.17,
                eve_min * 0.085,
                night_min * 0.045,
                intl_min * 0.27,
                churn
            ));
        }
        out
    }

    /// Writes `rows` generated records to `path`
    pub fn write_csv(&mut self, path: &Path, rows: usize) {
        std::fs::write(path, self.csv(rows)).expect("Failed to write churn CSV");
    }
}

impl Default for ChurnDataGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

/// One row object with every feature set to `value`
pub fn feature_object(value: f64) -> Value {
    let fields: Map<String, Value> = FEATURE_COLUMNS
        .iter()
        .map(|f| (f.to_string(), json!(value)))
        .collect();
    Value::Object(fields)
}

/// Split-oriented payload with `rows` positional rows
pub fn positional_payload(rows: usize) -> String {
    let data: Vec<Vec<f64>> = (0..rows).map(|i| vec![i as f64; FEATURE_COUNT]).collect();
    json!({
        "columns": FEATURE_COLUMNS,
        "index": (0..rows).collect::<Vec<_>>(),
        "data": data,
    })
    .to_string()
}
