use crate::models::{BadgeResult, ImageRequest, Layer, Template, User, UserData};
use crate::render::{resolve_image_url, Composer, RenderedBadge};
use crate::state::AppState;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

/// Walk the layer tree and collect every image the badge will place, with
/// the mm size it is placed at. Duplicate tuples collapse in the preloader.
pub fn collect_image_requests(template: &Template, user: &User) -> Vec<ImageRequest> {
    let dpi = template.dpi();
    let mut requests = Vec::new();
    collect_from_layers(&template.design.layers, template, user, dpi, &mut requests);
    requests
}

fn collect_from_layers(
    layers: &[Layer],
    template: &Template,
    user: &User,
    dpi: u32,
    requests: &mut Vec<ImageRequest>,
) {
    for layer in layers {
        if !layer.visible {
            continue;
        }
        if layer.kind == "image" {
            if let Some(url) = resolve_image_url(layer, template, user) {
                requests.push(ImageRequest {
                    url,
                    width_mm: layer.size.width,
                    height_mm: layer.size.height,
                    dpi,
                });
            }
        }
        if layer.kind == "container" && !layer.children.is_empty() {
            collect_from_layers(&layer.children, template, user, dpi, requests);
        }
    }
}

/// Union of image requests for a batch: the template's own assets resolve
/// identically for everyone, data-bound images differ per user.
pub fn collect_batch_image_requests(template: &Template, users: &[UserData]) -> Vec<ImageRequest> {
    let mut requests = Vec::new();
    for user_data in users {
        requests.extend(collect_image_requests(template, &user_data.user));
    }
    requests
}

/// Preload the request set, then give every URL that failed the batch pass
/// one inline retry so the composer never waits on the network itself.
async fn preload_with_retry(
    state: &AppState,
    requests: Vec<ImageRequest>,
) -> HashMap<String, Bytes> {
    let retry_pool = requests.clone();
    let mut images = state.preloader.preload(requests).await;
    for request in retry_pool {
        if images.contains_key(&request.url) {
            continue;
        }
        match state.preloader.load_one(&request).await {
            Ok(bytes) => {
                images.insert(request.url.clone(), bytes);
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "image unavailable for render");
            }
        }
    }
    images
}

/// Render one badge: collect, preload, compose. A badge with a broken layer
/// still returns its PDF bytes; only emission failures error.
pub async fn generate_badge(state: &AppState, template: &Template, user: &User) -> Result<Vec<u8>> {
    let requests = collect_image_requests(template, user);
    let images = preload_with_retry(state, requests).await;
    let badge = compose(state, template.clone(), user.clone(), Arc::new(images)).await?;
    Ok(badge.bytes)
}

async fn compose(
    state: &AppState,
    template: Template,
    user: User,
    images: Arc<HashMap<String, Bytes>>,
) -> Result<RenderedBadge> {
    let font_dir = state.config.font_dir.clone();
    let font_size_unit = state.config.font_size_unit;
    tokio::task::spawn_blocking(move || {
        Composer::new(&template, &user, &images, &font_dir, font_size_unit)?.render()
    })
    .await
    .context("badge compose task")?
}

/// Render a whole batch: one shared preload pass, then bounded-concurrency
/// composition with one result slot per input user. A failing user never
/// aborts the batch.
pub async fn generate_batch(
    state: Arc<AppState>,
    template: Template,
    users: Vec<UserData>,
) -> Vec<BadgeResult> {
    let requests = collect_batch_image_requests(&template, &users);
    let images = Arc::new(preload_with_retry(&state, requests).await);
    let template = Arc::new(template);

    let mut slots: Vec<Option<BadgeResult>> = vec![None; users.len()];
    let mut workers = JoinSet::new();
    for (index, user_data) in users.into_iter().enumerate() {
        let state = state.clone();
        let template = template.clone();
        let images = images.clone();
        workers.spawn(async move {
            let user = user_data.user;
            let permit = state.render_semaphore.clone().acquire_owned().await;
            let outcome = match permit {
                Ok(_permit) => compose(&state, (*template).clone(), user.clone(), images).await,
                Err(err) => Err(anyhow::anyhow!("render semaphore closed: {err}")),
            };
            // In batch mode a badge with broken layers is reported as a
            // failure so the caller can re-issue that user, even though the
            // single-badge path would still serve the degraded PDF.
            let result = match outcome {
                Ok(badge) if badge.layer_errors.is_empty() => BadgeResult {
                    user_id: user.id.clone(),
                    identifier: user.identifier.clone(),
                    success: true,
                    error: None,
                    pdf_base64: Some(BASE64.encode(badge.bytes)),
                },
                Ok(badge) => {
                    warn!(user = %user.id, errors = badge.layer_errors.len(), "batch badge degraded");
                    BadgeResult {
                        user_id: user.id.clone(),
                        identifier: user.identifier.clone(),
                        success: false,
                        error: Some(badge.layer_errors.join("; ")),
                        pdf_base64: None,
                    }
                }
                Err(err) => {
                    warn!(user = %user.id, error = %err, "batch badge failed");
                    BadgeResult {
                        user_id: user.id.clone(),
                        identifier: user.identifier.clone(),
                        success: false,
                        error: Some(err.to_string()),
                        pdf_base64: None,
                    }
                }
            };
            (index, result)
        });
    }
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(err) => warn!(error = %err, "batch worker panicked"),
        }
    }
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or(BadgeResult {
                user_id: String::new(),
                identifier: String::new(),
                success: false,
                error: Some("badge render did not complete".to_string()),
                pdf_base64: None,
            })
        })
        .collect()
}
