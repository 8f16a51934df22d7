//! [`QueryService`] backed by Amazon Athena.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, sts::AssumeRoleProvider};
use aws_sdk_athena::{Client, types::QueryExecutionState};
use log::debug;
use query_backfill_core::{
    ExecutionHandle, QueryService, QuerySpec, QueryState, ResultPage, ServiceError,
};

const SESSION_NAME: &str = "query-backfill";

/// Athena client bound to one region and credential chain.
#[derive(Clone, Debug)]
pub struct AthenaQueryService {
    client: Client,
}

impl AthenaQueryService {
    /// Build a client for the region of `spec`, assuming its role if one is
    /// configured.
    pub async fn connect(spec: &QuerySpec) -> Self {
        let region = Region::new(spec.region.clone());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut conf = aws_sdk_athena::config::Builder::from(&base);
        if let Some(arn) = &spec.assume_role_arn {
            debug!("Query {} assumes role {arn}", spec.name);
            let provider = AssumeRoleProvider::builder(arn.clone())
                .session_name(SESSION_NAME)
                .region(region)
                .configure(&base)
                .build()
                .await;
            conf = conf.credentials_provider(provider);
        }

        Self {
            client: Client::from_conf(conf.build()),
        }
    }
}

fn missing(what: &str) -> ServiceError {
    format!("Athena response is missing {what}").into()
}

#[async_trait]
impl QueryService for AthenaQueryService {
    async fn submit(&self, query: &str, workgroup: &str) -> Result<ExecutionHandle, ServiceError> {
        let out = self
            .client
            .start_query_execution()
            .query_string(query)
            .work_group(workgroup)
            .send()
            .await?;
        let id = out
            .query_execution_id()
            .ok_or_else(|| missing("the query execution id"))?;
        Ok(ExecutionHandle::new(id))
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<QueryState, ServiceError> {
        let out = self
            .client
            .get_query_execution()
            .query_execution_id(handle.as_str())
            .send()
            .await?;
        let status = out
            .query_execution()
            .and_then(|qe| qe.status())
            .ok_or_else(|| missing("the execution status"))?;
        let reason = status.state_change_reason().map(str::to_string);

        let state = match status.state() {
            Some(QueryExecutionState::Queued) => QueryState::Queued,
            Some(QueryExecutionState::Running) => QueryState::Running,
            Some(QueryExecutionState::Succeeded) => QueryState::Succeeded,
            Some(QueryExecutionState::Failed) => QueryState::Failed { reason },
            Some(QueryExecutionState::Cancelled) => QueryState::Cancelled { reason },
            Some(other) => return Err(format!("unknown execution state {other:?}").into()),
            None => return Err(missing("the execution state")),
        };
        Ok(state)
    }

    async fn results_page(
        &self,
        handle: &ExecutionHandle,
        page_size: usize,
        token: Option<&str>,
    ) -> Result<ResultPage, ServiceError> {
        let out = self
            .client
            .get_query_results()
            .query_execution_id(handle.as_str())
            .max_results(i32::try_from(page_size).unwrap_or(i32::MAX))
            .set_next_token(token.map(str::to_string))
            .send()
            .await?;

        let result_set = out.result_set().ok_or_else(|| missing("the result set"))?;
        let columns = result_set
            .result_set_metadata()
            .map(|meta| {
                meta.column_info()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let rows = result_set
            .rows()
            .iter()
            .map(|row| {
                row.data()
                    .iter()
                    .map(|d| d.var_char_value().map(str::to_string))
                    .collect()
            })
            .collect();

        Ok(ResultPage {
            columns,
            rows,
            next_token: out.next_token().map(str::to_string),
        })
    }
}
