use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

use crate::config::Environment;
use crate::error::{Error, Result};
use crate::model::request::{ObservationSetRequest, ObservationSetUpdate};
use crate::observations::ObservationService;
use crate::query::QueryEngine;
use crate::stats::AggregationEngine;
use crate::timestamps::{parse_boundary, parse_day, parse_instant, Boundary};

const ACTOR_HEADER: &str = "x-actor-id";
const DEVICE_HEADER: &str = "x-referring-device-id";

type Params = HashMap<String, String>;
type Reply = WithStatus<Json>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Storage(_) | Error::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(status: StatusCode, message: String) -> Reply {
    let response = ApiResponse {
        status: "error".to_string(),
        message,
    };
    warp::reply::with_status(warp::reply::json(&response), status)
}

fn respond<T: Serialize>(result: Result<T>) -> Reply {
    match result {
        Ok(data) => warp::reply::with_status(warp::reply::json(&data), StatusCode::OK),
        Err(err) => {
            if err.is_client_error() {
                debug!(error = %err, "request rejected");
            } else {
                error!(error = %err, "request failed");
            }
            error_reply(status_for(&err), err.to_string())
        }
    }
}

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::validation(format!("missing query parameter '{}'", name)))
}

/// Comma-separated list parameter.
fn list(params: &Params, name: &str) -> Result<Vec<String>> {
    Ok(required(params, name)?
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect())
}

fn flag(params: &Params, name: &str, default: bool) -> Result<bool> {
    match params.get(name).map(String::as_str) {
        None => Ok(default),
        Some("true") | Some("True") | Some("1") => Ok(true),
        Some("false") | Some("False") | Some("0") => Ok(false),
        Some(other) => Err(Error::validation(format!("invalid boolean '{}' for '{}'", other, name))),
    }
}

fn limit(params: &Params) -> Result<Option<usize>> {
    params
        .get("limit")
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| Error::validation(format!("invalid limit '{}'", raw)))
        })
        .transpose()
}

fn actor_id(header: Option<String>) -> Result<String> {
    header
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::validation(format!("missing '{}' header", ACTOR_HEADER)))
}

fn path_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::not_found(format!("Observation set with UUID {} not found", raw)))
}

pub struct RestApi {
    service: Arc<ObservationService>,
    query_engine: Arc<QueryEngine>,
    aggregation: Arc<AggregationEngine>,
    environment: Environment,
}

impl RestApi {
    pub fn new(
        service: Arc<ObservationService>,
        query_engine: Arc<QueryEngine>,
        aggregation: Arc<AggregationEngine>,
        environment: Environment,
    ) -> Self {
        RestApi {
            service,
            query_engine,
            aggregation,
            environment,
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let writes = self.create_observation_set().or(self.patch_observation_set());
        let reads = self
            .latest_observation_set()
            .or(self.latest_observation_sets_by_encounter())
            .or(self.observation_set_count())
            .or(self.observation_set_by_id())
            .or(self.observation_sets_by_encounter())
            .or(self.search_by_location())
            .or(self.search_by_locations())
            .or(self.observation_sets_for_patient())
            .or(self.observation_sets_modified_since());
        let reports = self
            .refresh_aggregates()
            .or(self.on_time_stats())
            .or(self.missing_stats())
            .or(self.lateness_intervals())
            .or(self.monthly_trends())
            .or(self.monthly_trends_by_location());

        writes.or(reads).or(reports)
    }

    fn create_observation_set(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let service = Arc::clone(&self.service);
        let environment = self.environment;

        warp::path!("dhos" / "v2" / "observation_set")
            .and(warp::post())
            .and(warp::query::<Params>())
            .and(warp::header::optional::<String>(ACTOR_HEADER))
            .and(warp::header::optional::<String>(DEVICE_HEADER))
            .and(warp::body::json())
            .and_then(
                move |params: Params, actor: Option<String>, device: Option<String>, request: ObservationSetRequest| {
                    let service = Arc::clone(&service);
                    async move {
                        let result = actor_id(actor).and_then(|actor_id| {
                            // Production always publishes.
                            let suppress = flag(&params, "suppress_obs_publish", false)?
                                && environment.allows_publish_suppression();
                            service.create_observation_set(&request, &actor_id, device.as_deref(), suppress)
                        });
                        Ok::<Reply, Infallible>(respond(result))
                    }
                },
            )
    }

    fn patch_observation_set(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("dhos" / "v2" / "observation_set" / String)
            .and(warp::patch())
            .and(warp::header::optional::<String>(ACTOR_HEADER))
            .and(warp::body::json())
            .and_then(move |set_id: String, actor: Option<String>, update: ObservationSetUpdate| {
                let service = Arc::clone(&service);
                async move {
                    let result = actor_id(actor).and_then(|actor_id| {
                        service.patch_observation_set(path_uuid(&set_id)?, &update, &actor_id)
                    });
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn observation_set_by_id(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set" / String)
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |set_id: String, params: Params| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = path_uuid(&set_id).and_then(|id| {
                        query_engine.observation_set_by_id(id, flag(&params, "compact", false)?)
                    });
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn observation_sets_by_encounter(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set")
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |params: Params| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = (|| -> Result<_> {
                        query_engine.observation_sets_for_encounters(
                            &list(&params, "encounter_id")?,
                            limit(&params)?,
                            flag(&params, "compact", true)?,
                        )
                    })();
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn latest_observation_set(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set" / "latest")
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |params: Params| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = list(&params, "encounter_id").and_then(|encounters| {
                        query_engine.latest_observation_set_for_encounters(&encounters, flag(&params, "compact", true)?)
                    });
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn latest_observation_sets_by_encounter(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set" / "latest")
            .and(warp::post())
            .and(warp::query::<Params>())
            .and(warp::body::json())
            .and_then(move |params: Params, encounters: Vec<String>| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = flag(&params, "compact", true).and_then(|compact| {
                        query_engine.latest_observation_sets_by_encounter_ids(&encounters, compact)
                    });
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn observation_set_count(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set" / "count")
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |encounters: Vec<String>| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    Ok::<Reply, Infallible>(respond(
                        query_engine.observation_set_count_for_encounters(&encounters),
                    ))
                }
            })
    }

    fn search_by_location(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set_search")
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |params: Params| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = list(&params, "location")
                        .and_then(|locations| search(&query_engine, &locations, &params));
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn search_by_locations(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_set_search")
            .and(warp::post())
            .and(warp::query::<Params>())
            .and(warp::body::json())
            .and_then(move |params: Params, locations: Vec<String>| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    Ok::<Reply, Infallible>(respond(search(&query_engine, &locations, &params)))
                }
            })
    }

    fn observation_sets_for_patient(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "patient" / String / "observation_set")
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |patient_id: String, params: Params| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = limit(&params)
                        .and_then(|limit| query_engine.observation_sets_for_patient(&patient_id, limit));
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn observation_sets_modified_since(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let query_engine = Arc::clone(&self.query_engine);

        warp::path!("dhos" / "v2" / "observation_sets")
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |params: Params| {
                let query_engine = Arc::clone(&query_engine);
                async move {
                    let result = (|| -> Result<_> {
                        let raw = required(&params, "modified_since")?;
                        let cutoff = parse_instant(raw)
                            .ok_or_else(|| Error::validation(format!("invalid timestamp '{}'", raw)))?;
                        query_engine.observation_sets_modified_since(cutoff, flag(&params, "compact", false)?)
                    })();
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }

    fn refresh_aggregates(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let aggregation = Arc::clone(&self.aggregation);

        warp::path!("dhos" / "v2" / "aggregate_obs")
            .and(warp::post())
            .and_then(move || {
                let aggregation = Arc::clone(&aggregation);
                async move {
                    // The rebuild scans every set; keep it off the async workers.
                    let reply = match tokio::task::spawn_blocking(move || aggregation.refresh()).await {
                        Ok(result) => respond(result),
                        Err(e) => {
                            error!(error = %e, "aggregate refresh task failed");
                            error_reply(StatusCode::INTERNAL_SERVER_ERROR, format!("refresh task failed: {}", e))
                        }
                    };
                    Ok::<Reply, Infallible>(reply)
                }
            })
    }

    fn on_time_stats(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let aggregation = Arc::clone(&self.aggregation);

        report_route("on_time_obs_stats").and_then(move |params: Params, locations: Vec<String>| {
            let aggregation = Arc::clone(&aggregation);
            async move {
                let result = report_range(&params)
                    .and_then(|(from, to)| aggregation.on_time_stats(from, to, &locations));
                Ok::<Reply, Infallible>(respond(result))
            }
        })
    }

    fn missing_stats(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let aggregation = Arc::clone(&self.aggregation);

        report_route("missing_obs_stats").and_then(move |params: Params, locations: Vec<String>| {
            let aggregation = Arc::clone(&aggregation);
            async move {
                let result = report_range(&params)
                    .and_then(|(from, to)| aggregation.missing_stats(from, to, &locations));
                Ok::<Reply, Infallible>(respond(result))
            }
        })
    }

    fn lateness_intervals(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let aggregation = Arc::clone(&self.aggregation);

        report_route("on_time_intervals").and_then(move |params: Params, locations: Vec<String>| {
            let aggregation = Arc::clone(&aggregation);
            async move {
                let result = report_range(&params)
                    .and_then(|(from, to)| aggregation.lateness_intervals(from, to, &locations));
                Ok::<Reply, Infallible>(respond(result))
            }
        })
    }

    fn monthly_trends(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let aggregation = Arc::clone(&self.aggregation);

        report_route("observation_sets_by_month").and_then(move |params: Params, locations: Vec<String>| {
            let aggregation = Arc::clone(&aggregation);
            async move {
                let result = report_range(&params)
                    .and_then(|(from, to)| aggregation.monthly_trends(from, to, &locations));
                Ok::<Reply, Infallible>(respond(result))
            }
        })
    }

    fn monthly_trends_by_location(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let aggregation = Arc::clone(&self.aggregation);

        warp::path!("dhos" / "v2" / "observation_sets_by_month")
            .and(warp::get())
            .and(warp::query::<Params>())
            .and_then(move |params: Params| {
                let aggregation = Arc::clone(&aggregation);
                async move {
                    let result = report_range(&params)
                        .and_then(|(from, to)| aggregation.monthly_trends_by_location(from, to));
                    Ok::<Reply, Infallible>(respond(result))
                }
            })
    }
}

/// `POST /dhos/v2/<name>?start_date=..&end_date=..` with a JSON list of
/// location ids as the body.
fn report_route(
    name: &'static str,
) -> impl Filter<Extract = (Params, Vec<String>), Error = warp::Rejection> + Clone {
    warp::path("dhos")
        .and(warp::path("v2"))
        .and(warp::path(name))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<Params>())
        .and(warp::body::json())
}

fn report_range(params: &Params) -> Result<(chrono::NaiveDate, chrono::NaiveDate)> {
    Ok((
        parse_day(required(params, "start_date")?)?,
        parse_day(required(params, "end_date")?)?,
    ))
}

fn search(
    query_engine: &QueryEngine,
    locations: &[String],
    params: &Params,
) -> Result<crate::query::LocationSearchResult> {
    let start = parse_boundary(required(params, "start_date")?, Boundary::StartOfDay)?;
    let end = parse_boundary(required(params, "end_date")?, Boundary::EndOfDay)?;
    query_engine.observation_sets_by_locations_and_date_range(
        locations,
        start,
        end,
        limit(params)?,
        flag(params, "compact", false)?,
    )
}
