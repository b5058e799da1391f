//! Request pipeline: classify, plan, gate, execute, map.
//!
//! Every stage returns `Result<_, Failure>`. [`FillService::settle`] is the
//! only place a failure turns into a response: it logs the diagnostic and
//! answers with the template's own defaults, so callers always get a
//! correctly shaped envelope back.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::LimitSettings;
use crate::db::{Row, RowSource, SchemaContext};
use crate::digest::payload_digest;
use crate::envelope::{Envelope, RequestKind};
use crate::error::{Diagnostic, ExecutionError, Failure, SynthesisError};
use crate::guard::SafetyGate;
use crate::handlers::{BoundQuery, FixedPlanBuilder, HandlerMode, HandlerRegistry};
use crate::mapper::Mapper;
use crate::pagination::Pagination;
use crate::rules::RuleTable;
use crate::synth::{
    check_count_pairing, check_plan_shape, SqlPlan, SynthesisMode, SynthesisRequest, Synthesizer,
};
use crate::template::Template;

/// Response key of the pagination block in batch responses.
pub const PAGINATION_KEY: &str = "pagination";

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub page_size: usize,
    pub synthesis_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&LimitSettings::default())
    }
}

impl From<&LimitSettings> for Limits {
    fn from(settings: &LimitSettings) -> Self {
        Self {
            page_size: settings.page_size.max(1),
            synthesis_timeout: settings.synthesis_timeout(),
            query_timeout: settings.query_timeout(),
        }
    }
}

pub struct FillService {
    rows: Arc<dyn RowSource>,
    synthesizer: Arc<dyn Synthesizer>,
    schema: Arc<SchemaContext>,
    rules: Arc<RuleTable>,
    handlers: Arc<HandlerRegistry>,
    gate: SafetyGate,
    limits: Limits,
}

impl FillService {
    pub fn new(
        rows: Arc<dyn RowSource>,
        synthesizer: Arc<dyn Synthesizer>,
        schema: Arc<SchemaContext>,
        rules: Arc<RuleTable>,
        handlers: Arc<HandlerRegistry>,
        limits: Limits,
    ) -> Self {
        let gate = SafetyGate::for_schema(&schema);
        Self {
            rows,
            synthesizer,
            schema,
            rules,
            handlers,
            gate,
            limits,
        }
    }

    pub async fn handle(&self, envelope: Envelope) -> Envelope {
        self.handle_until(envelope, None).await
    }

    /// Like [`handle`](Self::handle), with a caller deadline that narrows
    /// both the synthesis and the query budget.
    pub async fn handle_until(&self, envelope: Envelope, deadline: Option<Instant>) -> Envelope {
        let started = Instant::now();
        let template = Template::from_value(&envelope.response);
        let kind = RequestKind::classify(&envelope.payload);
        let result = self.process(&envelope, &template, &kind, deadline).await;
        let response = self.settle(result, &template, &kind);
        debug!(
            requester = %envelope.requester_service,
            kind = ?kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request filled"
        );
        envelope.with_response(response)
    }

    pub async fn process(
        &self,
        envelope: &Envelope,
        template: &Template,
        kind: &RequestKind,
        deadline: Option<Instant>,
    ) -> Result<Value, Diagnostic> {
        if template.is_null() {
            return Ok(Value::Object(Map::new()));
        }
        self.run(envelope, template, kind, deadline)
            .await
            .map_err(|failure| Diagnostic {
                requester: envelope.requester_service.clone(),
                payload_digest: payload_digest(&envelope.payload),
                failure,
            })
    }

    /// The one place failures become responses.
    pub fn settle(&self, result: Result<Value, Diagnostic>, template: &Template, kind: &RequestKind) -> Value {
        match result {
            Ok(value) => value,
            Err(diagnostic) => {
                warn!(
                    requester = %diagnostic.requester,
                    payload_digest = %diagnostic.payload_digest,
                    stage = %diagnostic.failure.stage(),
                    error = %diagnostic.failure,
                    "request degraded to template defaults"
                );
                self.degraded(template, kind)
            }
        }
    }

    fn degraded(&self, template: &Template, kind: &RequestKind) -> Value {
        if kind.is_batch() {
            self.fill_batch(template, None, &[], &Pagination::terminal())
        } else {
            self.mapper().map(&[], template)
        }
    }

    fn mapper(&self) -> Mapper<'_> {
        Mapper::new(&self.rules)
    }

    async fn run(
        &self,
        envelope: &Envelope,
        template: &Template,
        kind: &RequestKind,
        deadline: Option<Instant>,
    ) -> Result<Value, Failure> {
        if let Some(mode) = kind.handler_mode() {
            if let Some(handler) = self.handlers.resolve(&envelope.requester_service, mode) {
                debug!(handler = handler.name(), ?mode, "fixed plan");
                return self
                    .run_fixed(handler.as_ref(), mode, kind.cursor(), envelope, template, deadline)
                    .await;
            }
        }
        match kind {
            RequestKind::Batch { cursor } => {
                self.run_batch(envelope, template, cursor.clone(), deadline)
                    .await
            }
            RequestKind::Point | RequestKind::OnDemand => {
                self.run_point(envelope, template, deadline).await
            }
        }
    }

    async fn run_point(
        &self,
        envelope: &Envelope,
        template: &Template,
        deadline: Option<Instant>,
    ) -> Result<Value, Failure> {
        let plan = self
            .synthesize(SynthesisMode::Point, envelope, template, deadline)
            .await?;
        let rows = self.fetch(&plan, envelope, deadline).await?;
        Ok(self.mapper().map(&rows, template))
    }

    async fn run_batch(
        &self,
        envelope: &Envelope,
        template: &Template,
        cursor: Option<String>,
        deadline: Option<Instant>,
    ) -> Result<Value, Failure> {
        let page_size = self.limits.page_size;
        let data_mode = SynthesisMode::Batch {
            cursor: cursor.clone(),
            page_size,
        };
        let (plan, count_plan) = tokio::join!(
            self.synthesize(data_mode, envelope, template, deadline),
            self.synthesize(SynthesisMode::Count, envelope, template, deadline),
        );
        let plan = plan?;
        // A count over other filters would misreport the total.
        let count_plan = count_plan.and_then(|count| {
            check_count_pairing(&plan, &count)?;
            Ok(count)
        });
        let (rows, total) = tokio::join!(
            self.fetch(&plan, envelope, deadline),
            self.count_synthesized(count_plan, envelope, deadline),
        );
        let rows = rows?;
        let total = self.total_or_fallback(total.map(Some), envelope);
        let pagination = Pagination::compute(
            page_size,
            cursor.as_deref(),
            &rows,
            plan.cursor_column.as_deref(),
            total,
        );
        Ok(self.fill_batch(template, plan.entity.as_deref(), &rows, &pagination))
    }

    async fn run_fixed(
        &self,
        handler: &dyn FixedPlanBuilder,
        mode: HandlerMode,
        cursor: Option<&str>,
        envelope: &Envelope,
        template: &Template,
        deadline: Option<Instant>,
    ) -> Result<Value, Failure> {
        let page_size = self.limits.page_size;
        let plan = handler.build(mode, &envelope.payload, page_size)?;
        match mode {
            HandlerMode::OnDemand => {
                let rows = self.execute(&plan.data.sql, &plan.data.params, deadline).await?;
                let rows: Vec<Row> = rows.into_iter().take(1).map(|r| handler.assemble(r)).collect();
                Ok(self.mapper().map(&rows, template))
            }
            HandlerMode::Batch => {
                let (rows, total) = tokio::join!(
                    self.execute(&plan.data.sql, &plan.data.params, deadline),
                    self.count_fixed(plan.count.as_ref(), deadline),
                );
                let rows: Vec<Row> = rows?.into_iter().map(|r| handler.assemble(r)).collect();
                let total = self.total_or_fallback(total, envelope);
                let pagination =
                    Pagination::compute(page_size, cursor, &rows, Some(&plan.cursor_column), total);
                Ok(self.fill_batch(template, Some(&plan.entity_key), &rows, &pagination))
            }
        }
    }

    async fn fetch(&self, plan: &SqlPlan, envelope: &Envelope, deadline: Option<Instant>) -> Result<Vec<Row>, Failure> {
        let params = plan.bind(&envelope.payload)?;
        self.execute(&plan.sql, &params, deadline).await
    }

    async fn count_synthesized(
        &self,
        plan: Result<SqlPlan, Failure>,
        envelope: &Envelope,
        deadline: Option<Instant>,
    ) -> Result<u64, Failure> {
        let rows = self.fetch(&plan?, envelope, deadline).await?;
        count_value(&rows)
    }

    async fn count_fixed(&self, query: Option<&BoundQuery>, deadline: Option<Instant>) -> Result<Option<u64>, Failure> {
        let Some(query) = query else {
            return Ok(None);
        };
        let rows = self.execute(&query.sql, &query.params, deadline).await?;
        count_value(&rows).map(Some)
    }

    /// A failed count is not fatal: the page length stands in for the total.
    fn total_or_fallback(&self, total: Result<Option<u64>, Failure>, envelope: &Envelope) -> Option<u64> {
        match total {
            Ok(total) => total,
            Err(failure) => {
                warn!(
                    requester = %envelope.requester_service,
                    payload_digest = %payload_digest(&envelope.payload),
                    stage = "count",
                    error = %failure,
                    "count failed, total_records falls back to returned_records"
                );
                None
            }
        }
    }

    async fn synthesize(
        &self,
        mode: SynthesisMode,
        envelope: &Envelope,
        template: &Template,
        deadline: Option<Instant>,
    ) -> Result<SqlPlan, Failure> {
        let request = SynthesisRequest {
            mode: mode.clone(),
            requester: &envelope.requester_service,
            payload: &envelope.payload,
            template,
            schema: self.schema.as_ref(),
            rules: self.rules.as_ref(),
            max_rows: self.limits.page_size,
        };
        let budget = budget(self.limits.synthesis_timeout, deadline);
        let plan = tokio::time::timeout(budget, self.synthesizer.synthesize(&request))
            .await
            .map_err(|_| SynthesisError::Timeout(budget))??;
        check_plan_shape(&mode, &plan)?;
        debug!(
            synthesizer = self.synthesizer.name(),
            mode = mode.label(),
            sql = %plan.sql,
            params = ?plan.param_order,
            "plan ready"
        );
        Ok(plan)
    }

    /// Gate, then run within the remaining budget.
    async fn execute(
        &self,
        sql: &str,
        params: &[Option<String>],
        deadline: Option<Instant>,
    ) -> Result<Vec<Row>, Failure> {
        self.gate.inspect(sql)?;
        let budget = budget(self.limits.query_timeout, deadline);
        if budget.is_zero() {
            return Err(ExecutionError::Timeout(budget).into());
        }
        let rows = tokio::time::timeout(budget, self.rows.fetch(sql, params, budget))
            .await
            .map_err(|_| ExecutionError::Timeout(budget))??;
        Ok(rows)
    }

    /// Batch response: the entity list, a `pagination` block, and template
    /// defaults everywhere else.
    fn fill_batch(&self, template: &Template, entity: Option<&str>, rows: &[Row], pagination: &Pagination) -> Value {
        let mapper = self.mapper();
        let fields = match template {
            Template::Object(fields) => fields,
            Template::Array(items) => return mapper.map_each(rows, items.first()),
            _ => return mapper.map(rows, template),
        };

        let target = entity
            .and_then(|e| fields.iter().find(|(k, t)| k == e && t.is_array()))
            .or_else(|| fields.iter().find(|(_, t)| t.is_array()))
            .map(|(k, _)| k.as_str());
        if target.is_none() && !rows.is_empty() {
            debug!("batch template has no list field; rows dropped");
        }

        let mut out = Map::with_capacity(fields.len() + 1);
        for (name, t) in fields {
            let value = if Some(name.as_str()) == target {
                mapper.map_each(rows, t.shape())
            } else if name == PAGINATION_KEY {
                pagination.to_value()
            } else {
                t.to_value()
            };
            out.insert(name.clone(), value);
        }
        out.entry(PAGINATION_KEY)
            .or_insert_with(|| pagination.to_value());
        Value::Object(out)
    }
}

fn budget(limit: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(d) => limit.min(d.saturating_duration_since(Instant::now())),
        None => limit,
    }
}

fn count_value(rows: &[Row]) -> Result<u64, Failure> {
    rows.first()
        .and_then(|row| row.values().next())
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .ok_or_else(|| ExecutionError::UnexpectedResult("count query returned no number".into()).into())
}

impl Default for FillService {
    /// A service with no datastore behind it: every lookup finds nothing.
    fn default() -> Self {
        struct Empty;

        #[async_trait::async_trait]
        impl RowSource for Empty {
            async fn fetch(&self, _: &str, _: &[Option<String>], _: Duration) -> Result<Vec<Row>, ExecutionError> {
                Ok(Vec::new())
            }
        }

        Self::new(
            Arc::new(Empty),
            Arc::new(crate::synth::RuleBasedSynthesizer::new()),
            Arc::new(SchemaContext::builtin()),
            Arc::new(RuleTable::builtin()),
            Arc::new(HandlerRegistry::builtin()),
            Limits::default(),
        )
    }
}
