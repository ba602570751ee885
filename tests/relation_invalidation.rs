use std::sync::Arc;

use pubcache::cache::refresher::{
    CONTENT_REFRESHER_ID, CONTENT_TYPE_REFRESHER_ID, MEDIA_REFRESHER_ID,
};
use pubcache::cache::{
    CacheConfig, CacheContext, CacheContextBuilder, Collaborators, FarmConfig, ValueCacheKey,
};
use pubcache::domain::entities::ContentEntity;
use pubcache::domain::kits::{ContentNodeKit, ROOT_ID};
use pubcache::domain::relations::Relation;
use pubcache::domain::types::{ContentKind, ContentType, PropertyCacheLevel, PropertyType};
use pubcache::infra::memory::{
    MemoryContentSource, MemoryContentTypeSource, MemoryRelationService,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ARTICLE_TYPE: i32 = 100;
const IMAGE_TYPE: i32 = 200;
const ARTICLE_ID: i32 = 10;
const IMAGE_ID: i32 = 20;

fn article_type() -> ContentType {
    ContentType {
        id: ARTICLE_TYPE,
        alias: "article".to_string(),
        kind: ContentKind::Document,
        property_types: vec![
            PropertyType::new("hero", "Umbraco.MediaPicker3", PropertyCacheLevel::Elements),
            PropertyType::new("title", "Umbraco.TextBox", PropertyCacheLevel::Element),
            PropertyType::new("summary", "Umbraco.TextArea", PropertyCacheLevel::Snapshot),
        ],
    }
}

fn image_type() -> ContentType {
    ContentType {
        id: IMAGE_TYPE,
        alias: "image".to_string(),
        kind: ContentKind::Media,
        property_types: vec![PropertyType::new(
            "umbracoFile",
            "Umbraco.ImageCropper",
            PropertyCacheLevel::Element,
        )],
    }
}

fn article(hero: Uuid) -> ContentNodeKit {
    let mut entity = ContentEntity::new(
        ContentKind::Document,
        ARTICLE_ID,
        Uuid::from_u128(ARTICLE_ID as u128),
        ROOT_ID,
        format!("{ROOT_ID},{ARTICLE_ID}"),
        ARTICLE_TYPE,
        "Launch notes",
    )
    .expect("article entity");
    entity.set_value("hero", None, json!(hero.to_string()));
    entity.set_value("title", None, json!("Launch notes"));
    entity.set_value("summary", None, json!("What shipped this week"));
    entity.publish();
    entity.to_kit()
}

fn image(file: &str) -> ContentNodeKit {
    let mut entity = ContentEntity::new(
        ContentKind::Media,
        IMAGE_ID,
        Uuid::from_u128(IMAGE_ID as u128),
        ROOT_ID,
        format!("{ROOT_ID},{IMAGE_ID}"),
        IMAGE_TYPE,
        "Hero image",
    )
    .expect("image entity");
    entity.set_value("umbracoFile", None, json!(file));
    entity.to_kit()
}

struct Site {
    source: Arc<MemoryContentSource>,
    relations: Arc<MemoryRelationService>,
    context: CacheContext,
    cancel: CancellationToken,
}

async fn start_site() -> Site {
    let image_key = Uuid::from_u128(IMAGE_ID as u128);
    let source = Arc::new(MemoryContentSource::with_kits([
        article(image_key),
        image("/media/hero.png"),
    ]));
    let relations = Arc::new(MemoryRelationService::with_relations([Relation::new(
        ARTICLE_ID,
        IMAGE_ID,
        "umbMedia",
    )]));
    let content_types = Arc::new(MemoryContentTypeSource::with_types([
        article_type(),
        image_type(),
    ]));

    let context = CacheContextBuilder::new(
        CacheConfig {
            enable_local_store: false,
            ..CacheConfig::default()
        },
        FarmConfig::single_server("web-1"),
        Collaborators {
            content: source.clone(),
            relations: relations.clone(),
            content_types,
        },
    )
    .build()
    .expect("context should build");

    let cancel = CancellationToken::new();
    let report = context.start(cancel.clone()).await;
    assert_eq!(report.content_types, Some(2));
    drop(report.sync_task);

    Site {
        source,
        relations,
        context,
        cancel,
    }
}

fn hero_key() -> ValueCacheKey {
    ValueCacheKey::new(Uuid::from_u128(ARTICLE_ID as u128), "hero", None, false)
}

async fn read_hero(context: &CacheContext) -> serde_json::Value {
    let article = context
        .documents()
        .get_by_id(ARTICLE_ID)
        .await
        .expect("read article")
        .expect("article is published");
    article.value("hero", None)
}

#[tokio::test]
async fn refreshing_related_media_clears_the_referencing_document_value() {
    let site = start_site().await;

    let hero = read_hero(&site.context).await;
    assert_eq!(hero, json!(Uuid::from_u128(IMAGE_ID as u128).to_string()));
    assert!(site.context.elements().contains(&hero_key()));

    site.source.upsert(image("/media/hero-v2.png"));
    site.context
        .distributed()
        .refresh(MEDIA_REFRESHER_ID, &[IMAGE_ID])
        .await
        .expect("refresh media");

    assert!(!site.context.elements().contains(&hero_key()));
    let media = site
        .context
        .media()
        .get_by_id(IMAGE_ID)
        .await
        .expect("read media")
        .expect("media cached");
    assert_eq!(media.value("umbracoFile", None), json!("/media/hero-v2.png"));

    // Next read recomputes and caches again.
    read_hero(&site.context).await;
    assert!(site.context.elements().contains(&hero_key()));
    site.cancel.cancel();
}

#[tokio::test]
async fn neighbor_refresh_leaves_element_and_snapshot_values_alone() {
    let site = start_site().await;
    let before = site
        .context
        .documents()
        .get_by_id(ARTICLE_ID)
        .await
        .expect("read article")
        .expect("article is published");
    assert_eq!(before.value("title", None), json!("Launch notes"));
    assert_eq!(before.value("summary", None), json!("What shipped this week"));
    before.value("hero", None);
    // Only the elements-level value is shared across views.
    assert_eq!(site.context.elements().len(), 1);

    site.source.upsert(image("/media/hero-v2.png"));
    site.context
        .distributed()
        .refresh(MEDIA_REFRESHER_ID, &[IMAGE_ID])
        .await
        .expect("refresh media");

    assert!(site.context.elements().is_empty());
    let after = site
        .context
        .documents()
        .get_by_id(ARTICLE_ID)
        .await
        .expect("read article")
        .expect("article is published");
    assert!(Arc::ptr_eq(before.kit(), after.kit()));
    assert_eq!(before.value("title", None), json!("Launch notes"));
    assert_eq!(after.value("title", None), json!("Launch notes"));
    assert_eq!(after.value("summary", None), json!("What shipped this week"));
    site.cancel.cancel();
}

#[tokio::test]
async fn unrelated_refresh_keeps_cached_values() {
    let site = start_site().await;
    read_hero(&site.context).await;

    site.relations.forget(IMAGE_ID);
    site.context
        .distributed()
        .refresh(MEDIA_REFRESHER_ID, &[IMAGE_ID])
        .await
        .expect("refresh media");

    assert!(site.context.elements().contains(&hero_key()));
    site.cancel.cancel();
}

#[tokio::test]
async fn relation_lookup_failure_still_refreshes_the_tree() {
    let site = start_site().await;
    read_hero(&site.context).await;

    site.relations.set_offline(true);
    site.source.upsert(image("/media/hero-v3.png"));
    site.context
        .distributed()
        .refresh(MEDIA_REFRESHER_ID, &[IMAGE_ID])
        .await
        .expect("refresh media");

    let media = site
        .context
        .media()
        .get_by_id(IMAGE_ID)
        .await
        .expect("read media")
        .expect("media cached");
    assert_eq!(media.value("umbracoFile", None), json!("/media/hero-v3.png"));
    // Neighbors could not be resolved, so their values survive.
    assert!(site.context.elements().contains(&hero_key()));
    site.cancel.cancel();
}

#[tokio::test]
async fn removing_the_referencing_document_clears_its_own_values() {
    let site = start_site().await;
    read_hero(&site.context).await;

    site.context
        .distributed()
        .remove(CONTENT_REFRESHER_ID, &[ARTICLE_ID])
        .await
        .expect("remove article");

    assert!(!site.context.elements().contains(&hero_key()));
    assert!(
        site.context
            .documents()
            .get_by_id(ARTICLE_ID)
            .await
            .expect("read")
            .is_none()
    );
    site.cancel.cancel();
}

#[tokio::test]
async fn content_type_refresh_clears_every_elements_value() {
    let site = start_site().await;
    read_hero(&site.context).await;
    assert!(!site.context.elements().is_empty());

    site.context
        .distributed()
        .refresh(CONTENT_TYPE_REFRESHER_ID, &[ARTICLE_TYPE])
        .await
        .expect("refresh content type");

    assert!(!site.context.elements().contains(&hero_key()));
    site.cancel.cancel();
}
