//! Feed pipeline orchestration
//!
//! A run loads every candidate document and every user's history once,
//! derives a population profile from them, then ranks and persists feeds for
//! the targeted users chunk by chunk. Chunks either run in this process or
//! are handed to sibling workers through a [`ChunkDispatcher`] along with the
//! population sum, so a worker only reads the histories of its own users.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{
        Document, FeedKey, InteractionHistory, RelevanceWeights, UserFilter, WordFrequencyProfile,
    },
    services::{
        affinity::{aggregate_profile, document_profile, relevance_weights, ProfileAccumulator},
        batch_writer::{BatchCommitter, BatchUpdateSpec, BatchWriter, WriteMode, MAX_BATCH_SIZE},
        concurrency::BoundedConcurrencyMapper,
        dispatch::{ChunkDispatcher, ChunkReport, ChunkRequest},
        ranker::{build_entries, CandidateDocument, EngagementMemo, FeedRanker},
        repository::{feed_update, FeedRepository, ProfileCache},
        retry::RetryPolicy,
    },
};

/// Ids per `documents_by_ids` call when loading history documents
const HISTORY_DOCUMENT_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub feed_size: usize,
    pub user_concurrency: usize,
    pub chunk_size: usize,
    pub max_chunks: usize,
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
    /// One extra feed per user per category
    pub categories: Vec<String>,
    pub isolate_user_failures: bool,
    pub attach_engagement: bool,
    pub exclude_bet_documents: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            feed_size: 48,
            user_concurrency: 30,
            chunk_size: 30,
            max_chunks: 50,
            max_batch_size: MAX_BATCH_SIZE,
            retry: RetryPolicy::default(),
            categories: Vec::new(),
            isolate_user_failures: false,
            attach_engagement: true,
            exclude_bet_documents: true,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            feed_size: config.feed_size,
            user_concurrency: config.user_concurrency,
            chunk_size: config.chunk_size,
            max_chunks: config.max_chunks,
            max_batch_size: config.max_batch_size,
            retry: RetryPolicy::new(config.retry_max_attempts, config.retry_initial_backoff())
                .with_call_timeout(config.call_timeout()),
            categories: config
                .feed_categories
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            isolate_user_failures: config.isolate_user_failures,
            attach_engagement: config.attach_engagement,
            exclude_bet_documents: config.exclude_bet_documents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    pub users_targeted: usize,
    pub users_ranked: usize,
    pub users_failed: usize,
    /// Users in chunks beyond the per-run limit
    pub users_skipped: usize,
    /// Users whose history could not be read and who were left out of the population
    pub population_excluded: usize,
    pub feeds_written: usize,
    pub chunks_processed: usize,
    pub chunks_skipped: usize,
}

impl RunSummary {
    fn absorb(&mut self, report: ChunkReport) {
        self.users_ranked += report.users_ranked;
        self.users_failed += report.users_failed;
        self.feeds_written += report.feeds_written;
        self.chunks_processed += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProfileRefreshSummary {
    pub users: usize,
    pub profiles_written: usize,
    pub users_failed: usize,
}

/// Everything a run reads before ranking, shared by all of its chunks
pub struct RunContext {
    now: DateTime<Utc>,
    candidates: Vec<CandidateDocument>,
    /// Histories of the users being ranked
    histories: BTreeMap<String, InteractionHistory>,
    /// Ranked users whose history could not be read; only populated when failures are isolated
    unavailable: HashSet<String>,
    user_sums: BTreeMap<String, ProfileAccumulator>,
    population: ProfileAccumulator,
    /// Users left out of the population because their history could not be read
    population_excluded: usize,
}

impl RunContext {
    /// Aggregate profile of the documents this user bet on or clicked
    pub fn yours_profile(&self, user_id: &str) -> WordFrequencyProfile {
        self.user_sums
            .get(user_id)
            .map(ProfileAccumulator::to_profile)
            .unwrap_or_default()
    }

    /// Aggregate profile of every other user's engaged documents
    pub fn others_profile(&self, user_id: &str) -> WordFrequencyProfile {
        match self.user_sums.get(user_id) {
            Some(own) => self.population.without(own).to_profile(),
            None => self.population.to_profile(),
        }
    }

    pub fn weights_for(&self, user_id: &str) -> RelevanceWeights {
        relevance_weights(&self.yours_profile(user_id), &self.others_profile(user_id))
    }

    pub fn population(&self) -> &ProfileAccumulator {
        &self.population
    }

    pub fn population_excluded(&self) -> usize {
        self.population_excluded
    }
}

pub struct FeedPipeline {
    repository: Arc<dyn FeedRepository>,
    writer: BatchWriter,
    profile_cache: Option<Arc<dyn ProfileCache>>,
    dispatcher: Option<Arc<dyn ChunkDispatcher>>,
    ranker: FeedRanker,
    settings: PipelineSettings,
}

impl FeedPipeline {
    pub fn new(
        repository: Arc<dyn FeedRepository>,
        committer: Arc<dyn BatchCommitter>,
        settings: PipelineSettings,
    ) -> Self {
        let writer = BatchWriter::new(committer, settings.max_batch_size, settings.retry.clone());
        let ranker = FeedRanker::new(settings.feed_size, settings.exclude_bet_documents);

        Self {
            repository,
            writer,
            profile_cache: None,
            dispatcher: None,
            ranker,
            settings,
        }
    }

    pub fn with_profile_cache(mut self, profile_cache: Arc<dyn ProfileCache>) -> Self {
        self.profile_cache = Some(profile_cache);
        self
    }

    /// Fan chunks out to workers instead of ranking them in this process
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn ChunkDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(&self, filter: &UserFilter) -> AppResult<RunSummary> {
        self.run_at(filter, Utc::now()).await
    }

    /// Ranks and persists feeds for every user matched by `filter` as of `now`
    pub async fn run_at(&self, filter: &UserFilter, now: DateTime<Utc>) -> AppResult<RunSummary> {
        let retry = &self.settings.retry;
        let repository = &self.repository;

        let users = retry.run("load_users", || repository.users(filter)).await?;
        let user_ids: Vec<String> = users.into_iter().map(|u| u.id).collect();

        let chunk_size = self.settings.chunk_size.max(1);
        let mut chunks: Vec<Vec<String>> = user_ids
            .chunks(chunk_size)
            .map(<[String]>::to_vec)
            .collect();

        let mut summary = RunSummary {
            users_targeted: user_ids.len(),
            ..RunSummary::default()
        };

        if chunks.len() > self.settings.max_chunks {
            let leftover = chunks.split_off(self.settings.max_chunks);
            summary.chunks_skipped = leftover.len();
            summary.users_skipped = leftover.iter().map(Vec::len).sum();
            tracing::warn!(
                chunks_skipped = summary.chunks_skipped,
                users_skipped = summary.users_skipped,
                max_chunks = self.settings.max_chunks,
                "Chunk limit reached, remaining users wait for the next run"
            );
        }

        tracing::info!(
            filter = %filter,
            users = summary.users_targeted,
            chunks = chunks.len(),
            fan_out = self.dispatcher.is_some(),
            "Starting feed run"
        );

        if chunks.is_empty() {
            return Ok(summary);
        }

        match &self.dispatcher {
            Some(dispatcher) => {
                // Workers rank against the coordinator's population instead of rebuilding it
                let context = self.build_context(now, &[], None).await?;
                summary.population_excluded = context.population_excluded();
                let population = context.population().clone();

                let requests: Vec<ChunkRequest> = chunks
                    .into_iter()
                    .enumerate()
                    .map(|(chunk_index, user_ids)| ChunkRequest {
                        chunk_index,
                        user_ids,
                        as_of: now,
                        population: Some(population.clone()),
                    })
                    .collect();

                let mapper = BoundedConcurrencyMapper::new(self.settings.max_chunks)?;
                let reports = mapper
                    .map(requests, move |request| async move {
                        retry
                            .run("dispatch_chunk", || dispatcher.dispatch(&request))
                            .await
                    })
                    .await?;
                for report in reports {
                    summary.absorb(report);
                }
            }
            None => {
                let targets: Vec<String> = chunks.iter().flatten().cloned().collect();
                let context = self.build_context(now, &targets, None).await?;
                summary.population_excluded = context.population_excluded();

                let memo = EngagementMemo::new();
                for (chunk_index, user_ids) in chunks.into_iter().enumerate() {
                    let report = self
                        .process_chunk(&context, chunk_index, user_ids, &memo)
                        .await?;
                    summary.absorb(report);
                }
            }
        }

        tracing::info!(
            users_ranked = summary.users_ranked,
            users_failed = summary.users_failed,
            feeds_written = summary.feeds_written,
            chunks_processed = summary.chunks_processed,
            chunks_skipped = summary.chunks_skipped,
            population_excluded = summary.population_excluded,
            "Feed run completed"
        );

        Ok(summary)
    }

    /// Worker entry point: ranks and persists one chunk against its own context
    pub async fn run_chunk(&self, request: ChunkRequest) -> AppResult<ChunkReport> {
        let ChunkRequest {
            chunk_index,
            user_ids,
            as_of,
            population,
        } = request;

        if user_ids.is_empty() {
            return Ok(ChunkReport::default());
        }

        let context = self.build_context(as_of, &user_ids, population).await?;
        self.process_chunk(&context, chunk_index, user_ids, &EngagementMemo::new())
            .await
    }

    /// Loads candidates and histories, and sums the population profile
    ///
    /// Only history reads of `targets` are fail-fast. Without a `population`
    /// every user's history is read to build one; a user outside `targets`
    /// whose history cannot be read is left out of it. With a `population`
    /// only the targets' histories are read.
    pub async fn build_context(
        &self,
        now: DateTime<Utc>,
        targets: &[String],
        population: Option<ProfileAccumulator>,
    ) -> AppResult<RunContext> {
        let retry = &self.settings.retry;
        let repository = &self.repository;
        let isolate = self.settings.isolate_user_failures;
        let target_set: HashSet<&str> = targets.iter().map(String::as_str).collect();
        let target_set = &target_set;

        let documents = retry
            .run("load_candidates", || {
                repository.candidate_documents().try_collect::<Vec<Document>>()
            })
            .await?;
        let candidates: Vec<CandidateDocument> =
            documents.into_iter().map(CandidateDocument::new).collect();

        let readers: Vec<String> = match &population {
            Some(_) => targets.to_vec(),
            None => {
                let users = retry
                    .run("load_users", || repository.users(&UserFilter::All))
                    .await?;
                users
                    .into_iter()
                    .map(|user| user.id)
                    .chain(targets.iter().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            }
        };

        let mapper = BoundedConcurrencyMapper::new(self.settings.user_concurrency)?;
        let loaded = mapper
            .map(readers, move |user_id| async move {
                let result = retry
                    .run("interaction_history", || {
                        repository.interaction_history(&user_id)
                    })
                    .await;
                match result {
                    Ok(history) => Ok((user_id, Some(history))),
                    Err(e) if !target_set.contains(user_id.as_str()) => {
                        tracing::warn!(
                            user_id = %user_id,
                            error = %e,
                            "History unavailable, user left out of the population"
                        );
                        Ok((user_id, None))
                    }
                    Err(e) if isolate => {
                        tracing::warn!(
                            user_id = %user_id,
                            error = %e,
                            "History unavailable, user skipped"
                        );
                        Ok((user_id, None))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        let mut loaded_histories = BTreeMap::new();
        let mut unavailable = HashSet::new();
        let mut population_excluded = 0;
        for (user_id, history) in loaded {
            match history {
                Some(history) => {
                    loaded_histories.insert(user_id, history);
                }
                None => {
                    if target_set.contains(user_id.as_str()) {
                        unavailable.insert(user_id);
                    } else {
                        population_excluded += 1;
                    }
                }
            }
        }

        let mut profiles: HashMap<String, WordFrequencyProfile> = candidates
            .iter()
            .map(|c| (c.document.id.clone(), c.profile.clone()))
            .collect();

        // Engaged documents that are no longer candidates still shape taste
        let missing: Vec<String> = loaded_histories
            .values()
            .flat_map(InteractionHistory::engaged_document_ids)
            .filter(|id| !profiles.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for batch in missing.chunks(HISTORY_DOCUMENT_BATCH) {
            let documents = retry
                .run("history_documents", || repository.documents_by_ids(batch))
                .await?;
            for document in documents {
                profiles.insert(document.id.clone(), document_profile(&document));
            }
        }

        let summing = population.is_none();
        let mut population = population.unwrap_or_default();
        let mut histories = BTreeMap::new();
        let mut user_sums = BTreeMap::new();
        for (user_id, history) in loaded_histories {
            let mut sum = ProfileAccumulator::new();
            for document_id in history.engaged_document_ids() {
                if let Some(profile) = profiles.get(&document_id) {
                    sum.add(profile);
                }
            }
            if summing {
                population.merge(&sum);
            }
            if target_set.contains(user_id.as_str()) {
                user_sums.insert(user_id.clone(), sum);
                histories.insert(user_id, history);
            }
            // One user's sum at a time, then let other tasks run
            tokio::task::yield_now().await;
        }

        tracing::info!(
            repository = repository.name(),
            candidates = candidates.len(),
            users = histories.len(),
            users_unavailable = unavailable.len(),
            population_excluded,
            history_documents = missing.len(),
            population_documents = population.documents(),
            "Run context built"
        );

        Ok(RunContext {
            now,
            candidates,
            histories,
            unavailable,
            user_sums,
            population,
            population_excluded,
        })
    }

    async fn process_chunk(
        &self,
        context: &RunContext,
        chunk_index: usize,
        user_ids: Vec<String>,
        memo: &EngagementMemo,
    ) -> AppResult<ChunkReport> {
        let mapper = BoundedConcurrencyMapper::new(self.settings.user_concurrency)?;
        let isolate = self.settings.isolate_user_failures;

        let outcomes = mapper
            .map(user_ids, move |user_id| async move {
                match self.rank_user(context, &user_id, memo).await {
                    Ok(updates) => Ok(Some(updates)),
                    Err(e) if isolate => {
                        tracing::warn!(
                            user_id = %user_id,
                            chunk = chunk_index,
                            error = %e,
                            "Ranking failed, user skipped"
                        );
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        let mut report = ChunkReport::default();
        let mut updates: Vec<BatchUpdateSpec> = Vec::new();
        for outcome in outcomes {
            match outcome {
                Some(user_updates) => {
                    report.users_ranked += 1;
                    updates.extend(user_updates);
                }
                None => report.users_failed += 1,
            }
        }

        let written = self.writer.write(&updates, WriteMode::Overwrite).await?;
        report.feeds_written = written.records;

        tracing::info!(
            chunk = chunk_index,
            users_ranked = report.users_ranked,
            users_failed = report.users_failed,
            feeds_written = report.feeds_written,
            "Chunk processed"
        );

        Ok(report)
    }

    /// Ranks the main feed and every category feed of one user
    async fn rank_user(
        &self,
        context: &RunContext,
        user_id: &str,
        memo: &EngagementMemo,
    ) -> AppResult<Vec<BatchUpdateSpec>> {
        if context.unavailable.contains(user_id) {
            return Err(AppError::TransientIo(format!(
                "history for user {} could not be loaded",
                user_id
            )));
        }

        let empty = InteractionHistory::default();
        let history = context.histories.get(user_id).unwrap_or(&empty);
        let weights = context.weights_for(user_id);
        let now = context.now;
        let retry = &self.settings.retry;
        let repository = &self.repository;

        let keys = std::iter::once(FeedKey::main(user_id)).chain(
            self.settings
                .categories
                .iter()
                .map(|category| FeedKey::category(user_id, category.clone())),
        );

        let mut updates = Vec::new();
        for key in keys {
            let ranked = self.ranker.rank(
                &context.candidates,
                &weights,
                history,
                key.category.as_deref(),
                now,
            );

            let fetch = move |document_id: String| async move {
                memo.get_or_fetch(
                    &document_id,
                    retry.run("recent_engagement", || {
                        repository.recent_engagement(&document_id, now)
                    }),
                )
                .await
            };
            let lookup = self.settings.attach_engagement.then_some(fetch);

            let entries = build_entries(&ranked, lookup).await?;
            tracing::debug!(
                user_id = %user_id,
                feed = %key,
                entries = entries.len(),
                "Feed ranked"
            );
            updates.push(feed_update(&key, &entries)?);
        }

        Ok(updates)
    }

    /// Recomputes and caches the engaged-document profile of each matched user
    pub async fn refresh_profiles(&self, filter: &UserFilter) -> AppResult<ProfileRefreshSummary> {
        let profile_cache = self
            .profile_cache
            .as_deref()
            .ok_or_else(|| AppError::InvalidInput("No profile cache is configured".to_string()))?;
        let retry = &self.settings.retry;
        let repository = &self.repository;
        let isolate = self.settings.isolate_user_failures;

        let users = retry.run("load_users", || repository.users(filter)).await?;
        let mut summary = ProfileRefreshSummary {
            users: users.len(),
            ..ProfileRefreshSummary::default()
        };

        let mapper = BoundedConcurrencyMapper::new(self.settings.user_concurrency)?;
        let outcomes = mapper
            .map(users, move |user| async move {
                match self.refresh_user_profile(profile_cache, &user.id).await {
                    Ok(()) => Ok(true),
                    Err(e) if isolate => {
                        tracing::warn!(
                            user_id = %user.id,
                            error = %e,
                            "Profile refresh failed, user skipped"
                        );
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        for written in outcomes {
            if written {
                summary.profiles_written += 1;
            } else {
                summary.users_failed += 1;
            }
        }

        tracing::info!(
            users = summary.users,
            profiles_written = summary.profiles_written,
            users_failed = summary.users_failed,
            "Profile refresh completed"
        );

        Ok(summary)
    }

    async fn refresh_user_profile(
        &self,
        profile_cache: &dyn ProfileCache,
        user_id: &str,
    ) -> AppResult<()> {
        let retry = &self.settings.retry;
        let repository = &self.repository;

        let history = retry
            .run("interaction_history", || repository.interaction_history(user_id))
            .await?;
        let document_ids = history.engaged_document_ids();
        let documents = retry
            .run("history_documents", || repository.documents_by_ids(&document_ids))
            .await?;

        let profiles: Vec<WordFrequencyProfile> = documents.iter().map(document_profile).collect();
        let profile = aggregate_profile(&profiles);

        retry
            .run("store_profile", || profile_cache.store_profile(user_id, &profile))
            .await
    }
}
