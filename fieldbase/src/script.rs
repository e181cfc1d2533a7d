//! Lifecycle script sandbox.
//!
//! Scripts are rhai. Each run gets a fresh engine with operation, depth, size and wall-clock
//! limits, so a runaway script fails its own run and nothing else. Field placeholders
//! `$<table>_<field>` are rewritten to `row["<field>"]` before compilation; `set_field` and
//! `send_notification` are host functions whose effects are collected and applied only when the
//! script completes.

use regex::{Captures, Regex};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::collaborators::Notification;
use crate::settings::ScriptSettings;
use crate::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Create,
    Update,
    Read,
}

impl UserAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UserAction::Create => "create",
            UserAction::Update => "update",
            UserAction::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMoment {
    BeforeSave,
    AfterSave,
    OnLoad,
}

impl ExecutionMoment {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMoment::BeforeSave => "before_save",
            ExecutionMoment::AfterSave => "after_save",
            ExecutionMoment::OnLoad => "on_load",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptContext {
    pub user_action: UserAction,
    pub execution_moment: ExecutionMoment,
    pub table_id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutcome {
    pub success: bool,
    /// Row attributes after the script ran. Absent on failure.
    pub data: Option<Map<String, Value>>,
    pub error: Option<String>,
    /// Queued by the script; delivered by the caller only on success.
    pub notifications: Vec<Notification>,
}

impl ScriptOutcome {
    fn failed(error: impl Into<String>) -> Self {
        ScriptOutcome { success: false, data: None, error: Some(error.into()), notifications: Vec::new() }
    }
}

/// Rewrites `$<table>_<field>` for the table's own fields. Longer slugs are tried first so that
/// `price_net` is never read as `price` followed by `_net`.
pub fn rewrite_placeholders(script: &str, table_slug: &str, field_slugs: &[String]) -> Result<String, regex::Error> {
    if field_slugs.is_empty() {
        return Ok(script.to_string());
    }
    let mut slugs: Vec<&String> = field_slugs.iter().collect();
    slugs.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let alternatives: Vec<String> = slugs.iter().map(|s| regex::escape(s)).collect();
    let pattern = format!(r"\${}_({})\b", regex::escape(table_slug), alternatives.join("|"));
    let placeholder = Regex::new(&pattern)?;
    Ok(placeholder.replace_all(script, |caps: &Captures| format!("row[\"{}\"]", &caps[1])).into_owned())
}

#[derive(Debug, Clone, Default)]
pub struct ScriptSandbox {
    settings: ScriptSettings,
}

impl ScriptSandbox {
    pub fn new(settings: ScriptSettings) -> Self {
        ScriptSandbox { settings }
    }

    pub fn settings(&self) -> &ScriptSettings {
        &self.settings
    }

    fn engine(&self, label: String) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.settings.max_operations);
        engine.set_max_call_levels(self.settings.max_call_levels);
        engine.set_max_string_size(self.settings.max_string_size);
        engine.set_max_array_size(self.settings.max_array_size);
        engine.set_max_map_size(self.settings.max_map_size);
        engine.disable_symbol("eval");
        engine.disable_symbol("import");
        engine.set_module_resolver(DummyModuleResolver::new());

        let started = Instant::now();
        let timeout = self.settings.timeout;
        engine.on_progress(move |_| if started.elapsed() > timeout { Some(Dynamic::from("timeout")) } else { None });

        let print_label = label.clone();
        engine.on_print(move |text| info!("[script {}] {}", print_label, text));
        engine.on_debug(move |text, _, pos: Position| info!("[script {}] {} @ {}", label, text, pos));
        engine
    }

    /// Runs one script against a row. Every failure, including compile errors and exceeded
    /// limits, comes back as an unsuccessful outcome rather than an error.
    pub fn run(&self, script: &str, row: &Map<String, Value>, table_slug: &str, field_slugs: &[String], ctx: &ScriptContext) -> ScriptOutcome {
        let source = match rewrite_placeholders(script, table_slug, field_slugs) {
            Ok(source) => source,
            Err(e) => return ScriptOutcome::failed(format!("placeholder rewrite failed: {}", e)),
        };

        let edits: Rc<RefCell<Vec<(String, Value)>>> = Rc::new(RefCell::new(Vec::new()));
        let outbox: Rc<RefCell<Vec<Notification>>> = Rc::new(RefCell::new(Vec::new()));

        let mut engine = self.engine(format!("{}:{}", table_slug, ctx.execution_moment.as_str()));
        let set_field_edits = Rc::clone(&edits);
        engine.register_fn("set_field", move |name: ImmutableString, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let value: Value = rhai::serde::from_dynamic(&value)?;
            set_field_edits.borrow_mut().push((name.to_string(), value));
            Ok(())
        });
        let notification_outbox = Rc::clone(&outbox);
        engine.register_fn("send_notification", move |to: ImmutableString, subject: ImmutableString, body: ImmutableString| {
            notification_outbox.borrow_mut().push(Notification { to: to.to_string(), subject: subject.to_string(), body: body.to_string() });
        });

        let row_dynamic = match rhai::serde::to_dynamic(row) {
            Ok(dynamic) => dynamic,
            Err(e) => return ScriptOutcome::failed(e.to_string()),
        };
        let mut scope = Scope::new();
        scope.push_dynamic("row", row_dynamic);
        scope.push_constant("userAction", ctx.user_action.as_str().to_string());
        scope.push_constant("executionMoment", ctx.execution_moment.as_str().to_string());
        scope.push_constant("tableId", ctx.table_id.clone());
        scope.push_constant_dynamic("userId", ctx.user_id.clone().map(Dynamic::from).unwrap_or(Dynamic::UNIT));

        let result = engine.compile_with_scope(&scope, &source).map_err(|e| e.to_string()).and_then(|ast| {
            engine.run_ast_with_scope(&mut scope, &ast).map_err(|e| e.to_string())
        });
        if let Err(error) = result {
            warn!("script {} on '{}' failed: {}", ctx.execution_moment.as_str(), table_slug, error);
            return ScriptOutcome::failed(error);
        }

        let mut data = match scope.get_value::<Dynamic>("row").map(|dynamic| rhai::serde::from_dynamic::<Value>(&dynamic)) {
            Some(Ok(Value::Object(map))) => map,
            Some(Ok(_)) => return ScriptOutcome::failed("script replaced `row` with a non-map value"),
            Some(Err(e)) => return ScriptOutcome::failed(e.to_string()),
            None => row.clone(),
        };
        for (name, value) in edits.borrow_mut().drain(..) {
            data.insert(name, value);
        }
        let notifications = outbox.borrow_mut().drain(..).collect();
        ScriptOutcome { success: true, data: Some(data), error: None, notifications }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn ctx(moment: ExecutionMoment) -> ScriptContext {
        ScriptContext { user_action: UserAction::Create, execution_moment: moment, table_id: "t1".into(), user_id: Some("u1".into()) }
    }

    fn row(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn slugs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn placeholders_prefer_the_longest_slug() {
        let rewritten = rewrite_placeholders("$shop_price + $shop_price_net - $other_price", "shop", &slugs(&["price", "price_net"])).unwrap();
        assert_eq!(rewritten, "row[\"price\"] + row[\"price_net\"] - $other_price");
    }

    #[test]
    fn placeholders_and_helpers_edit_the_row() {
        let sandbox = ScriptSandbox::default();
        let script = r#"
            $products_name = $products_name + "!";
            if $products_price > 100 { set_field("tier", "premium"); }
        "#;
        let outcome = sandbox.run(script, &row(json!({"name": "Chair", "price": 150})), "products", &slugs(&["name", "price", "tier"]), &ctx(ExecutionMoment::BeforeSave));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(Value::Object(outcome.data.unwrap()), json!({"name": "Chair!", "price": 150, "tier": "premium"}));
    }

    #[test]
    fn thrown_errors_become_failed_outcomes() {
        let sandbox = ScriptSandbox::default();
        let outcome = sandbox.run(r#"throw "price missing";"#, &row(json!({})), "products", &[], &ctx(ExecutionMoment::BeforeSave));
        assert!(!outcome.success);
        assert!(outcome.data.is_none());
        assert!(outcome.error.unwrap().contains("price missing"));
    }

    #[test]
    fn runaway_scripts_hit_the_operation_limit() {
        let sandbox = ScriptSandbox::new(ScriptSettings { max_operations: 1_000, ..ScriptSettings::default() });
        let outcome = sandbox.run("loop { }", &row(json!({})), "products", &[], &ctx(ExecutionMoment::OnLoad));
        assert!(!outcome.success);
    }

    #[test]
    fn wall_clock_budget_terminates_scripts() {
        let sandbox = ScriptSandbox::new(ScriptSettings { max_operations: 0, timeout: Duration::from_millis(20), ..ScriptSettings::default() });
        let outcome = sandbox.run("let x = 0; loop { x += 1; }", &row(json!({})), "products", &[], &ctx(ExecutionMoment::OnLoad));
        assert!(!outcome.success);
    }

    #[test]
    fn eval_is_not_available() {
        let outcome = ScriptSandbox::default().run(r#"eval("1 + 1")"#, &row(json!({})), "products", &[], &ctx(ExecutionMoment::OnLoad));
        assert!(!outcome.success);
    }

    #[test]
    fn modules_cannot_be_imported_from_disk() {
        let dir = std::env::temp_dir().join(format!("fieldbase_modules_{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("secret.rhai"), r#"export const SECRET = "host-file-contents";"#).unwrap();
        let script = format!(r#"import "{}" as m; set_field("leak", m::SECRET);"#, dir.join("secret").display());

        let outcome = ScriptSandbox::default().run(&script, &row(json!({})), "products", &[], &ctx(ExecutionMoment::BeforeSave));
        assert!(!outcome.success);
        assert!(outcome.data.is_none());
    }

    #[test]
    fn context_variables_and_notifications() {
        let script = r#"
            if userAction == "create" && executionMoment == "after_save" {
                send_notification("ops@example.com", "new row in " + tableId, "by " + userId);
            }
        "#;
        let outcome = ScriptSandbox::default().run(script, &row(json!({})), "products", &[], &ctx(ExecutionMoment::AfterSave));
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(
            outcome.notifications,
            vec![Notification { to: "ops@example.com".into(), subject: "new row in t1".into(), body: "by u1".into() }]
        );
    }

    #[test]
    fn failed_scripts_drop_queued_notifications() {
        let script = r#"send_notification("a@b.c", "s", "b"); throw "no";"#;
        let outcome = ScriptSandbox::default().run(script, &row(json!({})), "products", &[], &ctx(ExecutionMoment::AfterSave));
        assert!(!outcome.success);
        assert!(outcome.notifications.is_empty());
    }
}
