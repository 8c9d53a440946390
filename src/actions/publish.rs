//! Image publishing: authenticate, build the image, tag and push
//!
//! The three sub-operations are available as separate actions
//! (`registry-login`, `image-build`, `image-push`) and combined as
//! `publish-image`. A failure in one prevents the ones after it.

use crate::actions::{Action, ActionContext, ActionInputs, ActionOutcome};
use crate::core::PipelineError;
use crate::runtime::{ContainerRuntime, ImageBuildRequest};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Tag applied to the most recent build of a base path
pub const LATEST_TAG: &str = "latest";

/// References for one build: the immutable SHA tag first, then `latest`
///
/// The base path is lower-cased since registries reject upper-case
/// repository names.
pub fn compute_tags(base: &str, sha: &str) -> Result<Vec<String>, PipelineError> {
    let base = base.trim().trim_end_matches('/').to_lowercase();
    let sha = sha.trim();

    if base.is_empty() {
        return Err(PipelineError::StepError("image base path is empty".to_string()));
    }
    if sha.is_empty() {
        return Err(PipelineError::StepError("commit SHA is empty".to_string()));
    }
    if base.rsplit('/').next().is_some_and(|last| last.contains(':')) {
        return Err(PipelineError::StepError(format!(
            "image base path '{}' must not carry a tag",
            base
        )));
    }

    Ok(vec![
        format!("{}:{}", base, sha),
        format!("{}:{}", base, LATEST_TAG),
    ])
}

/// Registry host of an image reference (`ghcr.io/acme/api` -> `ghcr.io`)
///
/// References without an explicit host live on Docker Hub.
pub fn registry_host(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => "docker.io".to_string(),
    }
}

/// Credentials and target of a registry login
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub registry: String,
    pub username: Option<String>,
    pub token: Option<String>,
}

impl RegistryAuth {
    /// Inputs: `registry` (default `settings.registry`, else the host of
    /// `settings.image`), `username` (default the actor credential),
    /// `password` (default the token credential)
    pub fn from_inputs(inputs: &ActionInputs, ctx: &ActionContext<'_>) -> Result<Self, PipelineError> {
        let registry = match inputs.or_setting("registry", ctx, "registry")? {
            Some(registry) => registry,
            None => ctx
                .setting("image")?
                .map(|image| registry_host(&image))
                .ok_or_else(|| PipelineError::StepError("no registry given".to_string()))?,
        };

        let credentials = ctx.run.credentials();
        Ok(Self {
            registry,
            username: inputs
                .get("username")
                .map(str::to_string)
                .or_else(|| credentials.actor.clone()),
            token: inputs
                .get("password")
                .map(str::to_string)
                .or_else(|| credentials.token.clone()),
        })
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Result of tagging and pushing one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedImage {
    pub image_id: String,

    /// Pushed references, in push order
    pub references: Vec<String>,
}

impl PublishedImage {
    fn outcome(&self, base: &str) -> ActionOutcome {
        let mut outcome = ActionOutcome::new()
            .with_output("image_id", self.image_id.as_str())
            .with_output("image", base.trim().trim_end_matches('/').to_lowercase())
            .with_output("tags", self.references.join(","))
            .with_log(
                self.references
                    .iter()
                    .map(|r| format!("Pushed {}", r))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        outcome.images = self.references.clone();
        outcome
    }
}

/// Drives the container runtime through the publish sub-operations
#[derive(Clone)]
pub struct ImagePublisher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImagePublisher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// (a) Log in to the registry
    ///
    /// A missing token or username is an `AuthError` and never reaches the
    /// runtime.
    pub async fn authenticate(&self, auth: &RegistryAuth) -> Result<(), PipelineError> {
        let token = auth
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PipelineError::AuthError(format!("no token available for {}", auth.registry))
            })?;
        let username = auth
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                PipelineError::AuthError(format!("no username available for {}", auth.registry))
            })?;

        self.runtime.login(&auth.registry, username, token).await
    }

    /// (b) Build the image and return its id
    pub async fn build_image(&self, request: &ImageBuildRequest) -> Result<String, PipelineError> {
        self.runtime.build(request).await
    }

    /// (c) Apply the SHA and `latest` tags to `image_id` and push both
    ///
    /// Both tags are applied before anything is pushed. Pushes go
    /// immutable tag first; a failed push is not retried and references
    /// already pushed stay in the registry.
    pub async fn tag_and_push(
        &self,
        image_id: &str,
        base: &str,
        sha: &str,
    ) -> Result<PublishedImage, PipelineError> {
        let references = compute_tags(base, sha)?;

        for reference in &references {
            self.runtime.tag(image_id, reference).await?;
        }

        let mut pushed = Vec::new();
        for reference in &references {
            if let Err(e) = self.runtime.push(reference).await {
                if pushed.is_empty() {
                    return Err(e);
                }
                warn!("Push of {} failed after pushing {}", reference, pushed.join(", "));
                return Err(PipelineError::PublishError(format!(
                    "{} (already pushed: {})",
                    e.message(),
                    pushed.join(", ")
                )));
            }
            info!("Pushed {}", reference);
            pushed.push(reference.clone());
        }

        Ok(PublishedImage {
            image_id: image_id.to_string(),
            references: pushed,
        })
    }

    /// Run (a), (b) and (c) in order
    pub async fn publish(
        &self,
        auth: &RegistryAuth,
        request: &ImageBuildRequest,
        base: &str,
        sha: &str,
    ) -> Result<PublishedImage, PipelineError> {
        self.authenticate(auth).await?;
        let image_id = self.build_image(request).await?;
        self.tag_and_push(&image_id, base, sha).await
    }
}

impl std::fmt::Debug for ImagePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePublisher").finish_non_exhaustive()
    }
}

/// Build request from step inputs
///
/// Inputs: `context` (default `.`), `file`, `target`, `build-args`
/// (`KEY=VALUE` lines). The run's artifact is passed as `ARTIFACT` and
/// `settings.port` as `PORT` unless given explicitly.
pub fn build_request(
    inputs: &ActionInputs,
    ctx: &ActionContext<'_>,
) -> Result<ImageBuildRequest, PipelineError> {
    let context = ctx.resolve_path(inputs.get("context").unwrap_or("."));
    let mut request = ImageBuildRequest::new(&context);

    if let Some(file) = inputs.get("file") {
        request = request.with_recipe(ctx.resolve_path(file));
    }
    if let Some(target) = inputs.get("target") {
        request = request.with_target(target);
    }

    for line in inputs.get("build-args").unwrap_or_default().lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            PipelineError::StepError(format!("invalid build arg '{}', expected KEY=VALUE", line))
        })?;
        request = request.with_build_arg(key.trim(), value.trim());
    }

    if !request.has_build_arg("ARTIFACT") {
        if let Some(artifact) = &ctx.run.artifact {
            match relative_to(&artifact.path, &context) {
                Some(relative) => request = request.with_build_arg("ARTIFACT", &relative),
                None => warn!(
                    "Artifact {} is outside the build context {}",
                    artifact.path.display(),
                    context.display()
                ),
            }
        }
    }
    if !request.has_build_arg("PORT") {
        if let Some(port) = ctx.setting("port")? {
            request = request.with_build_arg("PORT", &port);
        }
    }

    Ok(request
        .with_label("org.opencontainers.image.revision", ctx.sha())
        .with_label("org.opencontainers.image.title", &ctx.run.pipeline_name))
}

fn relative_to(path: &Path, base: &Path) -> Option<String> {
    path.strip_prefix(base)
        .ok()
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
}

fn image_base(inputs: &ActionInputs, ctx: &ActionContext<'_>) -> Result<String, PipelineError> {
    inputs
        .or_setting("image", ctx, "image")?
        .ok_or_else(|| PipelineError::StepError("no image base path given".to_string()))
}

fn image_sha(inputs: &ActionInputs, ctx: &ActionContext<'_>) -> String {
    inputs.get("sha").unwrap_or(ctx.sha()).to_string()
}

/// `registry-login`
#[derive(Debug, Clone)]
pub struct RegistryLogin {
    publisher: ImagePublisher,
}

impl RegistryLogin {
    pub fn new(publisher: ImagePublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Action for RegistryLogin {
    fn name(&self) -> &str {
        "registry-login"
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let auth = RegistryAuth::from_inputs(inputs, ctx)?;
        self.publisher.authenticate(&auth).await?;

        Ok(ActionOutcome::new()
            .with_output("registry", auth.registry.as_str())
            .with_log(format!(
                "Logged in to {} as {}",
                auth.registry,
                auth.username.unwrap_or_default()
            )))
    }
}

/// `image-build`
#[derive(Debug, Clone)]
pub struct ImageBuild {
    publisher: ImagePublisher,
}

impl ImageBuild {
    pub fn new(publisher: ImagePublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Action for ImageBuild {
    fn name(&self) -> &str {
        "image-build"
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let request = build_request(inputs, ctx)?;
        let image_id = self.publisher.build_image(&request).await?;

        Ok(ActionOutcome::new()
            .with_log(format!("Built image {}", image_id))
            .with_output("image_id", image_id))
    }
}

/// `image-push`
///
/// Inputs: `image_id` (required), `image` (default `settings.image`),
/// `sha` (default the event SHA).
#[derive(Debug, Clone)]
pub struct ImagePush {
    publisher: ImagePublisher,
}

impl ImagePush {
    pub fn new(publisher: ImagePublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Action for ImagePush {
    fn name(&self) -> &str {
        "image-push"
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let image_id = inputs.require(self.name(), "image_id")?;
        let base = image_base(inputs, ctx)?;
        let published = self
            .publisher
            .tag_and_push(image_id, &base, &image_sha(inputs, ctx))
            .await?;

        Ok(published.outcome(&base))
    }
}

/// `publish-image`: login, build, tag and push in one step
#[derive(Debug, Clone)]
pub struct PublishImage {
    publisher: ImagePublisher,
}

impl PublishImage {
    pub fn new(publisher: ImagePublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Action for PublishImage {
    fn name(&self) -> &str {
        "publish-image"
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let auth = RegistryAuth::from_inputs(inputs, ctx)?;
        let request = build_request(inputs, ctx)?;
        let base = image_base(inputs, ctx)?;
        let sha = image_sha(inputs, ctx);

        let published = self.publisher.publish(&auth, &request, &base, &sha).await?;
        Ok(published.outcome(&base))
    }
}

/// `image-metadata`: the tags a publish would push, without touching the
/// registry
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageMetadata;

#[async_trait]
impl Action for ImageMetadata {
    fn name(&self) -> &str {
        "image-metadata"
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let base = image_base(inputs, ctx)?;
        let tags = compute_tags(&base, &image_sha(inputs, ctx))?;

        Ok(ActionOutcome::new()
            .with_output("image", base.trim().trim_end_matches('/').to_lowercase())
            .with_output("sha_tag", tags[0].as_str())
            .with_output("latest_tag", tags[1].as_str())
            .with_output("tags", tags.join(","))
            .with_log(tags.join("\n")))
    }
}
