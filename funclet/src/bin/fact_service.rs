//! Host binary for funclet services: registers the demo functions and
//! becomes a service when spawned with a bootstrap plan.

use funclet::CallArgs;
use serde_json::{Value, json};

fn fact(call: CallArgs) -> anyhow::Result<Value> {
    let n = call
        .args
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("expected an integer argument"))?;
    if n < 0 {
        return Ok(call
            .kwargs
            .get("default")
            .cloned()
            .unwrap_or_else(|| json!("Default")));
    }
    fn product(n: i64) -> i64 {
        if n == 0 { 1 } else { n * product(n - 1) }
    }
    Ok(json!(product(n)))
}

fn reverse(call: CallArgs) -> anyhow::Result<Value> {
    let text = call
        .args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("expected a string argument"))?;
    let extra = call
        .kwargs
        .get("extra")
        .and_then(Value::as_str)
        .unwrap_or("MORE THINGS");
    let reversed: String = text.chars().rev().collect();
    Ok(json!(format!("{reversed}{extra}")))
}

fn main() {
    funclet::registry::register("fact", fact);
    funclet::registry::register("reverse", reverse);
    funclet::bootstrap::init();

    eprintln!(
        "fact_service hosts funclet services; spawn it with {} set to become one",
        funclet::PLAN_ENV_VAR
    );
    std::process::exit(2);
}
