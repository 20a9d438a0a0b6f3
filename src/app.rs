use leptos::prelude::*;
use leptos::server_fn::error::NoCustomError;
#[cfg(feature = "hydrate")]
use leptos::task::spawn_local;
use leptos_meta::{provide_meta_context, MetaTags, Stylesheet, Title};
use leptos_router::{
    components::{Route, Router, Routes},
    path,
};

use crate::model::ReelStanding;
#[cfg(feature = "ssr")]
use crate::{catalog::ReelCatalog, get_active_reels, get_all_aggregates, model::rank_reels, DbPool};

/// How often the board re-reads the standings in the browser.
#[cfg(feature = "hydrate")]
const REFRESH_MS: u32 = 5_000;

#[server(GetStandings)]
pub async fn get_standings(
    category: Option<String>,
) -> Result<Vec<ReelStanding>, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        let reels = get_active_reels(&mut conn)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        let aggregates = get_all_aggregates(&mut conn)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        Ok(rank_reels(&reels, &aggregates, category.as_deref()))
    })
    .await;
    match result {
        Ok(inner_result) => inner_result,
        Err(e) => Err(ServerFnError::ServerError(e.to_string())),
    }
}

#[server(GetCategories)]
pub async fn get_categories() -> Result<Vec<String>, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        get_active_reels(&mut conn)
            .map(|reels| ReelCatalog::new(reels).categories())
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))
    })
    .await;
    match result {
        Ok(inner_result) => inner_result,
        Err(e) => Err(ServerFnError::ServerError(e.to_string())),
    }
}

pub fn shell(options: LeptosOptions) -> impl IntoView {
    view! {
        <!DOCTYPE html>
        <html lang="en">
            <head>
                <meta charset="utf-8" />
                <meta name="viewport" content="width=device-width, initial-scale=1" />
                <AutoReload options=options.clone() />
                <HydrationScripts options />
                <MetaTags />
            </head>
            <body>
                <App />
            </body>
        </html>
    }
}

#[component]
pub fn App() -> impl IntoView {
    // Provides context that manages stylesheets, titles, meta tags, etc.
    provide_meta_context();

    view! {
        // id=leptos means cargo-leptos will hot-reload this stylesheet
        <Stylesheet id="leptos" href="/pkg/reel-vote.css" />

        <Title text="Reel Vote Results" />

        <Router>
            <main>
                <Routes fallback=|| "Page not found.".into_view()>
                    <Route path=path!("/") view=ResultsBoard />
                    <Route path=path!("/results") view=ResultsBoard />
                </Routes>
            </main>
        </Router>
    }
}

fn format_score(value: f64) -> String {
    format!("{value:.2}")
}

#[component]
fn ResultsBoard() -> impl IntoView {
    let category = RwSignal::new(None::<String>);
    // Bumped by the refresh timer; the standings resource re-runs whenever it changes.
    let tick = RwSignal::new(0u32);

    let categories = Resource::new(|| (), |_| get_categories());
    let standings = Resource::new(
        move || (category.get(), tick.get()),
        |(category, _)| get_standings(category),
    );

    #[cfg(feature = "hydrate")]
    {
        spawn_local(async move {
            loop {
                gloo_timers::future::TimeoutFuture::new(REFRESH_MS).await;
                if tick.try_update(|t| *t = t.wrapping_add(1)).is_none() {
                    break;
                }
            }
        });
    }

    view! {
        <div class="results">
            <h1>"Results"</h1>
            <label>
                "Category: "
                <select on:change=move |ev| {
                    let value = event_target_value(&ev);
                    category.set((!value.is_empty()).then_some(value));
                }>
                    <option value="">"All categories"</option>
                    <Suspense>
                        {move || {
                            categories
                                .with(|maybe_result| match maybe_result {
                                    Some(Ok(names)) => {
                                        names
                                            .iter()
                                            .map(|name| {
                                                view! { <option value=name.clone()>{name.clone()}</option> }
                                            })
                                            .collect_view()
                                            .into_any()
                                    }
                                    _ => view! {}.into_any(),
                                })
                        }}
                    </Suspense>
                </select>
            </label>
            <div class="table-responsive">
                <table class="results-table">
                    <tbody>
                        <tr>
                            <th>"#"</th>
                            <th>"Reel"</th>
                            <th>"Contestant"</th>
                            <th>"Category"</th>
                            <th>"Audience"</th>
                            <th>"Judges"</th>
                            <th>"Final"</th>
                        </tr>
                        <Suspense fallback=|| {
                            view! {
                                <tr>
                                    <td colspan="7">"Loading..."</td>
                                </tr>
                            }
                        }>
                            {move || {
                                standings
                                    .with(|maybe_result| match maybe_result {
                                        Some(Ok(rows)) if rows.is_empty() => {
                                            view! {
                                                <tr>
                                                    <td colspan="7">"No reels yet"</td>
                                                </tr>
                                            }
                                                .into_any()
                                        }
                                        Some(Ok(rows)) => {
                                            rows.iter()
                                                .enumerate()
                                                .map(|(rank, row)| {
                                                    let stats = row.stats;
                                                    view! {
                                                        <tr>
                                                            <td>{rank + 1}</td>
                                                            <td>
                                                                {row.reel.thumbnail.clone()} " "
                                                                {format!("#{}", row.reel.number)}
                                                            </td>
                                                            <td>{row.reel.contestant.clone()}</td>
                                                            <td>{row.reel.category.clone()}</td>
                                                            <td>
                                                                {format!(
                                                                    "{} ({} votes)",
                                                                    format_score(stats.audience_avg),
                                                                    stats.audience_count,
                                                                )}
                                                            </td>
                                                            <td>
                                                                {format!(
                                                                    "{} ({} votes)",
                                                                    format_score(stats.judge_avg),
                                                                    stats.judge_count,
                                                                )}
                                                            </td>
                                                            <td class="final-score">
                                                                {format_score(stats.final_score)}
                                                            </td>
                                                        </tr>
                                                    }
                                                })
                                                .collect_view()
                                                .into_any()
                                        }
                                        Some(Err(e)) => {
                                            leptos::logging::log!("Failed to load standings: {e}");
                                            view! {
                                                <tr>
                                                    <td colspan="7" class="error">"Could not load results"</td>
                                                </tr>
                                            }
                                                .into_any()
                                        }
                                        None => {
                                            view! {
                                                <tr>
                                                    <td colspan="7">"Loading..."</td>
                                                </tr>
                                            }
                                                .into_any()
                                        }
                                    })
                            }}
                        </Suspense>
                    </tbody>
                </table>
            </div>
        </div>
    }
}
