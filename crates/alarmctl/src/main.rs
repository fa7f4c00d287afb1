//! Rule management CLI: talks directly to the same SQLite store the running
//! service uses, with no RPC round-trip through the service process.

use std::process::ExitCode;

use alarm_engine_core::{
    AlarmKind, AlarmRule, AlarmStatus, ComparisonOperator, EngineError, Store,
};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "alarmctl", about = "Manage alarm engine rules")]
struct Cli {
    /// SQLite connection string; falls back to DB_URL, then a local default.
    #[arg(long, env = "DB_URL", default_value = "sqlite:alarm-engine.db?mode=rwc")]
    db_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a simple threshold alarm rule
    AddSimple {
        rule_id: String,
        device_id: String,
        sensor_field: String,
        operator: String,
        threshold: f64,
        duration_minutes: i64,
        description: String,
    },
    /// Add a conditional threshold alarm rule
    AddConditional {
        rule_id: String,
        device_id: String,
        sensor_field: String,
        operator: String,
        threshold: f64,
        duration_minutes: i64,
        shunt_device: String,
        shunt_field: String,
        shunt_operator: String,
        shunt_threshold: f64,
        description: String,
    },
    /// List alarm rules
    List {
        #[arg(long)]
        device: Option<String>,
    },
    /// Show details for one alarm rule
    Show { rule_id: String },
    /// Delete an alarm rule
    Delete { rule_id: String },
    /// Show currently active (or triggered) alarms
    Active,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.exit_code() == 0 {
                // --help / --version requested, not an error
                ExitCode::SUCCESS
            } else {
                // malformed invocation: missing/bad args, unknown subcommand
                ExitCode::from(1)
            };
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let store = match Store::connect(&cli.db_url).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e:#}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = store.migrate().await {
        eprintln!("Error migrating store: {e:#}");
        return ExitCode::from(2);
    }

    match run(&store, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            if e.downcast_ref::<EngineError>()
                .map(|ee| matches!(ee, EngineError::Validation(_)))
                .unwrap_or(false)
            {
                ExitCode::from(3)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

async fn run(store: &Store, command: Command) -> Result<ExitCode> {
    match command {
        Command::AddSimple {
            rule_id,
            device_id,
            sensor_field,
            operator,
            threshold,
            duration_minutes,
            description,
        } => {
            let Some(op) = ComparisonOperator::parse(&operator) else {
                return Err(EngineError::Validation(format!("unknown operator '{operator}'")).into());
            };
            let now = now_unix_seconds();
            let rule = AlarmRule {
                rule_id: rule_id.clone(),
                device_id,
                kind: AlarmKind::SimpleThreshold,
                sensor_field,
                threshold_value: threshold,
                operator: op,
                duration_seconds: duration_minutes * 60,
                description,
                enabled: true,
                shunt_device_id: None,
                shunt_field: None,
                shunt_value: None,
                shunt_operator: None,
                created_at: now,
                updated_at: now,
            };
            rule.validate()?;
            store.upsert_rule(&rule).await?;
            println!("Successfully added alarm rule: {rule_id}");
            Ok(ExitCode::SUCCESS)
        }

        Command::AddConditional {
            rule_id,
            device_id,
            sensor_field,
            operator,
            threshold,
            duration_minutes,
            shunt_device,
            shunt_field,
            shunt_operator,
            shunt_threshold,
            description,
        } => {
            let Some(op) = ComparisonOperator::parse(&operator) else {
                return Err(EngineError::Validation(format!("unknown operator '{operator}'")).into());
            };
            let Some(shunt_op) = ComparisonOperator::parse(&shunt_operator) else {
                return Err(
                    EngineError::Validation(format!("unknown shunt operator '{shunt_operator}'")).into(),
                );
            };
            let now = now_unix_seconds();
            let rule = AlarmRule {
                rule_id: rule_id.clone(),
                device_id,
                kind: AlarmKind::ConditionalThreshold,
                sensor_field,
                threshold_value: threshold,
                operator: op,
                duration_seconds: duration_minutes * 60,
                description,
                enabled: true,
                shunt_device_id: Some(shunt_device),
                shunt_field: Some(shunt_field),
                shunt_value: Some(shunt_threshold),
                shunt_operator: Some(shunt_op),
                created_at: now,
                updated_at: now,
            };
            rule.validate()?;
            store.upsert_rule(&rule).await?;
            println!("Successfully added conditional alarm rule: {rule_id}");
            Ok(ExitCode::SUCCESS)
        }

        Command::List { device } => {
            let rules = store.list_rules(device.as_deref(), false).await?;
            if rules.is_empty() {
                println!("No alarm rules found");
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "\n{:<20} {:<15} {:<22} {:<12} {:<10} {:<10} {:<10} {:<8}",
                "Rule ID", "Device ID", "Type", "Field", "Operator", "Threshold", "Duration", "Enabled"
            );
            println!("{}", "-".repeat(120));
            for rule in &rules {
                println!(
                    "{:<20} {:<15} {:<22} {:<12} {:<10} {:<10} {:<10} {}",
                    rule.rule_id,
                    rule.device_id,
                    kind_str(rule.kind),
                    rule.sensor_field,
                    rule.operator.as_str(),
                    rule.threshold_value,
                    rule.duration_seconds / 60,
                    rule.enabled,
                );
                if rule.is_conditional() {
                    println!(
                        "{:<20} {:<15} {:<22} {:<12} {:<10} {:<10}",
                        "└─ Shunt:",
                        rule.shunt_device_id.as_deref().unwrap_or(""),
                        "",
                        rule.shunt_field.as_deref().unwrap_or(""),
                        rule.shunt_operator.map(|o| o.as_str()).unwrap_or(""),
                        rule.shunt_value.unwrap_or(0.0),
                    );
                }
                println!();
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Show { rule_id } => {
            let Some(rule) = store.get_rule(&rule_id).await? else {
                println!("Alarm rule not found: {rule_id}");
                return Ok(ExitCode::from(2));
            };
            println!("\nAlarm Rule Details:");
            println!("  Rule ID: {}", rule.rule_id);
            println!("  Device ID: {}", rule.device_id);
            println!("  Type: {}", kind_str(rule.kind));
            println!("  Description: {}", rule.description);
            println!("  Sensor Field: {}", rule.sensor_field);
            println!("  Threshold: {} {}", rule.operator.as_str(), rule.threshold_value);
            println!("  Duration: {} minutes", rule.duration_seconds / 60);
            println!("  Enabled: {}", rule.enabled);
            println!("  Created: {}", rule.created_at);
            if rule.is_conditional() {
                println!("\n  Shunt Condition:");
                println!("    Device: {}", rule.shunt_device_id.as_deref().unwrap_or(""));
                println!("    Field: {}", rule.shunt_field.as_deref().unwrap_or(""));
                println!(
                    "    Condition: {} {}",
                    rule.shunt_operator.map(|o| o.as_str()).unwrap_or(""),
                    rule.shunt_value.unwrap_or(0.0)
                );
            }
            println!();
            Ok(ExitCode::SUCCESS)
        }

        Command::Delete { rule_id } => {
            store.delete_rule(&rule_id).await?;
            println!("Successfully deleted alarm rule: {rule_id}");
            Ok(ExitCode::SUCCESS)
        }

        Command::Active => {
            let states = store.list_states().await?;
            let active: Vec<_> = states
                .into_iter()
                .filter(|s| s.status.is_violation_active())
                .collect();
            if active.is_empty() {
                println!("No active alarms");
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "\n{:<20} {:<15} {:<12} {:<12} {:<12}",
                "Rule ID", "Device ID", "Status", "Duration", "Last Value"
            );
            println!("{}", "-".repeat(80));
            let now = now_unix_seconds();
            for state in &active {
                let duration = state.violation_duration_minutes(now);
                let last_value = state
                    .last_value
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                println!(
                    "{:<20} {:<15} {:<12} {:.1} min   {:<12}",
                    state.rule_id,
                    state.device_id,
                    status_str(state.status),
                    duration,
                    last_value,
                );
            }
            println!();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn kind_str(kind: AlarmKind) -> &'static str {
    match kind {
        AlarmKind::SimpleThreshold => "simple_threshold",
        AlarmKind::ConditionalThreshold => "conditional_threshold",
    }
}

fn status_str(status: AlarmStatus) -> &'static str {
    match status {
        AlarmStatus::Inactive => "inactive",
        AlarmStatus::Active => "active",
        AlarmStatus::Triggered => "triggered",
        AlarmStatus::Acknowledged => "acknowledged",
    }
}

fn now_unix_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
