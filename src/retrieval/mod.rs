//! Bullet retrieval and ranking
//!
//! Picks the `k` bullets worth embedding for a user message. Ranking blends
//! lexical relevance (hashed term vectors, see [`vectors`]) with each
//! bullet's track record from past tags. Pure: never touches the store.

pub mod vectors;

use std::cmp::Ordering;

use crate::types::{Bullet, BulletMetadata};
use vectors::{cosine_similarity, term_vector};

/// Bullets embedded when the caller does not ask for a specific number
pub const DEFAULT_K: usize = 20;

pub const RELEVANCE_WEIGHT: f32 = 0.8;
pub const TRACK_RECORD_WEIGHT: f32 = 0.2;

/// A bullet with the score it was ranked by
#[derive(Debug, Clone)]
pub struct ScoredBullet<'a> {
    pub bullet: &'a Bullet,
    pub relevance: f32,
    pub track_record: f32,
    pub score: f32,
}

/// Net helpfulness in (-1, 1); new bullets start at 0
pub fn track_record(metadata: &BulletMetadata) -> f32 {
    let net = metadata.helpful_count as f32 - metadata.harmful_count as f32;
    net / (metadata.total() as f32 + 2.0)
}

/// Score every bullet against `user_message`, best first
pub fn score<'a>(bullets: &'a [Bullet], user_message: &str) -> Vec<ScoredBullet<'a>> {
    let query = term_vector(user_message);

    let mut scored: Vec<ScoredBullet<'a>> = bullets
        .iter()
        .map(|bullet| {
            let relevance = cosine_similarity(&query, &term_vector(&bullet.content)).max(0.0);
            let track_record = track_record(&bullet.metadata);
            ScoredBullet {
                bullet,
                relevance,
                track_record,
                score: RELEVANCE_WEIGHT * relevance + TRACK_RECORD_WEIGHT * track_record,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.bullet.created_at.cmp(&b.bullet.created_at))
            .then_with(|| a.bullet.id.cmp(&b.bullet.id))
    });

    scored
}

/// The at most `k` bullets most relevant to `user_message`
pub fn rank(bullets: &[Bullet], user_message: &str, k: usize) -> Vec<Bullet> {
    if k == 0 {
        return Vec::new();
    }

    score(bullets, user_message)
        .into_iter()
        .take(k)
        .map(|scored| scored.bullet.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn bullets(contents: &[&str]) -> Vec<Bullet> {
        let base = Utc::now();
        contents
            .iter()
            .enumerate()
            .map(|(i, content)| {
                let mut bullet = Bullet::new("pb", *content);
                bullet.id = format!("b{}", i);
                bullet.created_at = base + Duration::seconds(i as i64);
                bullet
            })
            .collect()
    }

    #[test]
    fn test_relevant_bullet_first() {
        let pool = bullets(&[
            "Always log API latency",
            "Search the CRM for an existing lead before creating one",
            "Prefer short replies",
        ]);

        let ranked = rank(&pool, "create a new lead in the CRM", 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "b1");
    }

    #[test]
    fn test_bound_and_subset() {
        let pool = bullets(&["one lesson", "two lesson", "three lesson"]);

        for k in 0..5 {
            let ranked = rank(&pool, "lesson", k);
            assert_eq!(ranked.len(), k.min(pool.len()));
            assert!(ranked.iter().all(|b| pool.iter().any(|p| p.id == b.id)));
        }
        assert!(rank(&[], "anything", DEFAULT_K).is_empty());
    }

    #[test]
    fn test_deterministic() {
        let pool = bullets(&["dedupe leads", "check email format", "verify phone numbers"]);
        let first: Vec<_> = rank(&pool, "lead email", 3).into_iter().map(|b| b.id).collect();
        let second: Vec<_> = rank(&pool, "lead email", 3).into_iter().map(|b| b.id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_track_record_breaks_relevance_ties() {
        let mut pool = bullets(&["unrelated alpha", "unrelated beta"]);
        pool[1].metadata.helpful_count = 5;

        let ranked = rank(&pool, "", 2);
        assert_eq!(ranked[0].id, "b1");

        pool[1].metadata.harmful_count = 10;
        let ranked = rank(&pool, "", 2);
        assert_eq!(ranked[0].id, "b0");
    }

    #[test]
    fn test_ties_fall_back_to_age_then_id() {
        let mut pool = bullets(&["same", "same", "same"]);
        pool[2].created_at = pool[0].created_at;

        let ids: Vec<_> = rank(&pool, "", 3).into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["b0", "b2", "b1"]);
    }

    #[test]
    fn test_track_record_range() {
        let mut metadata = BulletMetadata::default();
        assert_eq!(track_record(&metadata), 0.0);

        metadata.helpful_count = 1000;
        assert!(track_record(&metadata) < 1.0);

        metadata.helpful_count = 0;
        metadata.harmful_count = 1000;
        assert!(track_record(&metadata) > -1.0);
    }
}
