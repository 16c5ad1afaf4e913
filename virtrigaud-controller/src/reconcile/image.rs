//! VMImage reconciler.
//!
//! Drives Pending -> Importing -> Preparing -> Ready | Failed against the
//! first usable provider whose hypervisor type has a declared variant,
//! honouring the prepare policy (auto-import vs require-existing, timeout,
//! retries).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use virtrigaud_api::condition::{set_condition, Condition, ConditionStatus, ConditionType};
use virtrigaud_api::image::{ImagePhase, ImageVariant, PrepareMode, PreparePolicy, VMImage};
use virtrigaud_api::provider::Provider;
use virtrigaud_api::{Object, ObjectKey};
use virtrigaud_provider::{ImagePrepareRequest, ProviderRpc, TaskRef};
use virtrigaud_store::{Api, EventType};

use crate::context::Ctx;
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

pub struct ImageReconciler {
    ctx: Arc<Ctx>,
}

impl ImageReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// First usable provider whose type has a declared variant.
    async fn prepare_target(
        &self,
        image: &VMImage,
    ) -> anyhow::Result<Option<(Provider, Arc<dyn ProviderRpc>, ImageVariant)>> {
        let providers: Api<Provider> = self.ctx.api();
        for provider in providers.list(Some(&image.meta.namespace)).await? {
            if !provider.is_usable() {
                continue;
            }
            let Some(variant) = image.variant_for(provider.spec.provider_type) else {
                continue;
            };
            match self.ctx.client_for(&provider).await {
                Ok(client) => return Ok(Some((provider, client, variant.clone()))),
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    fn policy(image: &VMImage) -> PreparePolicy {
        image.spec.prepare.clone().unwrap_or_default()
    }

    async fn mark_failed(
        &self,
        api: &Api<VMImage>,
        mut image: VMImage,
        message: String,
    ) -> ReconcileResult {
        warn!(image = %image.key(), message = %message, "image preparation failed");
        self.ctx
            .recorder
            .record(VMImage::KIND, &image.key(), EventType::Warning, "PrepareFailed", message.clone())
            .await;
        image.status.phase = ImagePhase::Failed;
        image.status.message = message;
        image.status.task_ref = None;
        set_condition(
            &mut image.status.conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::False, "PrepareFailed", ""),
        );
        image.status.observed_generation = image.meta.generation;
        api.update_status(&image).await?;
        Ok(Action::Done)
    }

    async fn mark_ready(&self, api: &Api<VMImage>, mut image: VMImage) -> ReconcileResult {
        info!(image = %image.key(), "image ready");
        self.ctx
            .recorder
            .record(VMImage::KIND, &image.key(), EventType::Normal, "Ready", "")
            .await;
        image.status.phase = ImagePhase::Ready;
        image.status.message.clear();
        image.status.task_ref = None;
        set_condition(
            &mut image.status.conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "ImageReady", ""),
        );
        image.status.observed_generation = image.meta.generation;
        api.update_status(&image).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for ImageReconciler {
    fn kind(&self) -> &'static str {
        VMImage::KIND
    }

    #[instrument(skip(self), fields(image = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<VMImage> = self.ctx.api();
        let Some(mut image) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if image.meta.is_deleting() {
            // Prepared hypervisor templates are shared artifacts and are
            // not torn down with the descriptor.
            return Ok(Action::Done);
        }

        if image.status.phase == ImagePhase::Ready {
            return Ok(Action::Done);
        }
        if image.status.phase == ImagePhase::Failed
            && image.status.attempts > Self::policy(&image).retries
        {
            return Ok(Action::Done);
        }

        let Some((provider, client, variant)) = self.prepare_target(&image).await? else {
            set_condition(
                &mut image.status.conditions,
                Condition::new(
                    ConditionType::WaitingForDependencies,
                    ConditionStatus::True,
                    "DependencyMissing",
                    "no usable provider with a matching variant",
                ),
            );
            image.status.observed_generation = image.meta.generation;
            api.update_status(&image).await?;
            return Ok(Action::RequeueAfter(requeue::TRANSIENT));
        };

        let policy = Self::policy(&image);

        if let Some(task) = image.status.task_ref.clone() {
            match client.task_status(&TaskRef::new(task)).await {
                Err(e) => {
                    warn!(image = %key, error = %e, "task poll failed");
                    return Ok(Action::RequeueAfter(requeue::ERROR));
                }
                Ok(st) if !st.done => {
                    // Prepare timeout applies per attempt.
                    let started = image.status.conditions.iter()
                        .find(|c| c.type_ == ConditionType::Provisioning)
                        .map(|c| c.last_transition_time);
                    if let Some(started) = started {
                        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
                        if elapsed > Duration::from_secs(policy.timeout_seconds) {
                            return self.mark_failed(&api, image, "prepare timed out".into()).await;
                        }
                    }
                    return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                }
                Ok(st) => {
                    image.status.task_ref = None;
                    if let Some(err) = st.error {
                        image.status.attempts += 1;
                        if image.status.attempts > policy.retries {
                            return self.mark_failed(&api, image, err).await;
                        }
                        image.status.phase = ImagePhase::Pending;
                        image.status.message = err;
                        image.status.observed_generation = image.meta.generation;
                        api.update_status(&image).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                    // Import finished; the hypervisor finalises the
                    // template in its prepare step.
                    image.status.phase = ImagePhase::Preparing;
                    image.status.observed_generation = image.meta.generation;
                    let image = api.update_status(&image).await?;
                    return self.mark_ready(&api, image).await;
                }
            }
        }

        match image.status.phase {
            ImagePhase::Pending | ImagePhase::Failed => {
                if policy.mode == PrepareMode::RequireExisting {
                    return if variant.template_name.is_some() {
                        self.mark_ready(&api, image).await
                    } else {
                        self.mark_failed(
                            &api,
                            image,
                            format!(
                                "prepare mode requires an existing template on {}",
                                provider.meta.name
                            ),
                        )
                        .await
                    };
                }

                let resp = match client
                    .image_prepare(ImagePrepareRequest {
                        image_name: image.meta.name.clone(),
                        template_name: variant.template_name.clone(),
                        url: variant.url.clone(),
                        format: variant.format.clone(),
                        checksum: variant.checksum.clone(),
                    })
                    .await
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        image.status.attempts += 1;
                        if image.status.attempts > policy.retries {
                            return self.mark_failed(&api, image, e.to_string()).await;
                        }
                        image.status.message = e.to_string();
                        image.status.observed_generation = image.meta.generation;
                        api.update_status(&image).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                };

                if resp.ready {
                    return self.mark_ready(&api, image).await;
                }
                image.status.phase = ImagePhase::Importing;
                image.status.task_ref = resp.task.map(|t| t.0);
                set_condition(
                    &mut image.status.conditions,
                    Condition::new(ConditionType::Provisioning, ConditionStatus::True, "Importing", ""),
                );
                image.status.observed_generation = image.meta.generation;
                api.update_status(&image).await?;
                Ok(Action::RequeueAfter(requeue::TRANSIENT))
            }
            ImagePhase::Importing | ImagePhase::Preparing => {
                // No task parked: the import completed on a previous pass.
                self.mark_ready(&api, image).await
            }
            ImagePhase::Ready => Ok(Action::Done),
        }
    }
}
