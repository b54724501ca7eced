//! Shared fixtures: a rooms/products catalog, its procedures and views, and
//! a replica that applies pull patches the way a client would.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use tenant_sync::procedures::{Fallback, MutationContext, Procedure, ProcedureKind, ProcedureRegistry};
use tenant_sync::sync::{
    Cookie, Mutation, Notifier, NoopNotifier, PatchOperation, PullRequest, PullResponse, PullResult, PushRequest,
    PushResponse, PushResult, SYNC_STATE_KEY,
};
use tenant_sync::{
    Entity, EntityId, EntityPatch, EntityReader, EntityStore, Policy, Principal, Role, RoleAcls, SyncConfig,
    SyncError, SyncServer, TenantId, ViewDescriptor, ViewRegistry, Visibility,
};

// =============================================================================
// Principals
// =============================================================================

pub fn acls() -> RoleAcls {
    RoleAcls::new()
        .grant(
            Role::Administrator,
            [
                "rooms:read",
                "products:read",
                "active_rooms:read",
                "published_products:read",
                "rooms:create",
                "products:create",
                "products:update",
                "products:publish",
                "products:delete",
                "room_editors:create",
            ],
        )
        .grant(
            Role::Operator,
            [
                "products:read",
                "active_rooms:read",
                "published_products:read",
                "products:create",
                "products:update",
                "products:publish",
                "products:delete",
            ],
        )
        .grant(
            Role::Customer,
            ["active_rooms:read", "published_products:read", "editable_products:read"],
        )
}

pub fn principal(tenant: &str, user: &str, role: Role) -> Principal {
    Principal::new(TenantId::new(tenant), user, role, &acls())
}

pub fn admin() -> Principal {
    principal("t1", "admin", Role::Administrator)
}

pub fn operator() -> Principal {
    principal("t1", "olga", Role::Operator)
}

pub fn customer(user: &str) -> Principal {
    principal("t1", user, Role::Customer)
}

// =============================================================================
// Views
// =============================================================================

fn published_room() -> Visibility {
    Visibility::And(vec![Visibility::Active, Visibility::field_equals("status", "published")])
}

pub fn views() -> ViewRegistry {
    let mut views = ViewRegistry::new();
    views
        .register(ViewDescriptor::for_table("rooms"))
        .unwrap()
        .register(ViewDescriptor::for_table("products"))
        .unwrap()
        .register(ViewDescriptor::new("active_rooms", "rooms", Visibility::Active))
        .unwrap()
        .register(ViewDescriptor::new(
            "published_products",
            "products",
            Visibility::And(vec![
                Visibility::Active,
                Visibility::field_equals("status", "published"),
                Visibility::parent_visible("rooms", "roomId", published_room()),
            ]),
        ))
        .unwrap()
        .register(ViewDescriptor::new(
            "editable_products",
            "products",
            Visibility::And(vec![
                Visibility::Active,
                Visibility::parent_visible(
                    "rooms",
                    "roomId",
                    Visibility::authorized_by("room_editors", "roomId", "userId"),
                ),
            ]),
        ))
        .unwrap();
    views
}

// =============================================================================
// Policies
// =============================================================================

fn is_room_editor(reader: &dyn EntityReader, room_id: &str, user_id: &str) -> bool {
    reader.rows("room_editors").any(|grant| {
        grant.is_active() && grant.field_str("roomId") == Some(room_id) && grant.field_str("userId") == Some(user_id)
    })
}

/// The actor edits the room the product (as of now) belongs to.
fn product_room_editor(product: EntityId) -> Policy {
    Policy::relationship("not an editor of the product's room", move |principal, reader| {
        let room = reader
            .find("products", &product)
            .and_then(|row| row.field_str("roomId"))
            .map(str::to_string);
        Ok(room.is_some_and(|room| is_room_editor(reader, &room, &principal.user_id)))
    })
}

// =============================================================================
// Procedures
// =============================================================================

fn data(fields: Value) -> Map<String, Value> {
    match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomArgs {
    pub id: EntityId,
    pub name: String,
    #[serde(default = "published")]
    pub status: String,
}

fn published() -> String {
    "published".into()
}

pub struct CreateRoom;

impl Procedure for CreateRoom {
    type Args = CreateRoomArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "createRoom"
    }

    fn validate(&self, args: &CreateRoomArgs) -> Result<(), String> {
        match args.status.as_str() {
            "draft" | "published" => Ok(()),
            other => Err(format!("unknown room status '{}'", other)),
        }
    }

    fn policy(&self, _args: &CreateRoomArgs) -> Policy {
        Policy::permission("rooms:create")
    }

    fn execute(&self, args: &CreateRoomArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        ctx.tx().create(
            "rooms",
            args.id.clone(),
            data(json!({"name": args.name, "status": args.status})),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantEditorArgs {
    pub room_id: EntityId,
    pub user_id: String,
}

pub struct GrantRoomEditor;

impl Procedure for GrantRoomEditor {
    type Args = GrantEditorArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "grantRoomEditor"
    }

    fn policy(&self, _args: &GrantEditorArgs) -> Policy {
        Policy::permission("room_editors:create")
    }

    fn execute(&self, args: &GrantEditorArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        ctx.tx().find_by_id("rooms", &args.room_id)?;
        ctx.tx().create(
            "room_editors",
            EntityId::generate(),
            data(json!({"roomId": args.room_id, "userId": args.user_id})),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductArgs {
    pub id: EntityId,
    pub room_id: EntityId,
    pub name: String,
}

pub struct CreateProduct;

impl Procedure for CreateProduct {
    type Args = CreateProductArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "createProduct"
    }

    fn validate(&self, args: &CreateProductArgs) -> Result<(), String> {
        if args.name.trim().is_empty() {
            return Err("name must not be blank".into());
        }
        Ok(())
    }

    fn policy(&self, args: &CreateProductArgs) -> Policy {
        Policy::some(vec![
            Policy::permission("products:create"),
            product_room_editor(args.id.clone()),
        ])
    }

    fn execute(&self, args: &CreateProductArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        ctx.tx().find_by_id("rooms", &args.room_id)?;
        ctx.tx().create(
            "products",
            args.id.clone(),
            data(json!({"roomId": args.room_id, "name": args.name, "status": "draft"})),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductArgs {
    pub id: EntityId,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

fn patch_with_token(patch: EntityPatch, updated_at: Option<i64>) -> EntityPatch {
    match updated_at {
        Some(token) => patch.expect_updated_at(token),
        None => patch,
    }
}

pub struct PublishProduct;

impl Procedure for PublishProduct {
    type Args = ProductArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "publishProduct"
    }

    fn policy(&self, _args: &ProductArgs) -> Policy {
        Policy::permission("products:publish")
    }

    fn execute(&self, args: &ProductArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        let patch = patch_with_token(EntityPatch::new().set("status", json!("published")), args.updated_at);
        ctx.tx().update_by_id("products", &args.id, patch)
    }
}

/// Back to draft. Room editors may do this without a static grant.
pub struct DraftProduct;

impl Procedure for DraftProduct {
    type Args = ProductArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "draftProduct"
    }

    fn policy(&self, args: &ProductArgs) -> Policy {
        Policy::some(vec![
            Policy::permission("products:update"),
            product_room_editor(args.id.clone()),
        ])
    }

    fn execute(&self, args: &ProductArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        let patch = patch_with_token(EntityPatch::new().set("status", json!("draft")), args.updated_at);
        ctx.tx().update_by_id("products", &args.id, patch)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameArgs {
    pub id: EntityId,
    pub name: String,
    pub updated_at: i64,
}

/// Requires the caller's `updatedAt`; published products are frozen.
pub struct RenameProduct;

impl Procedure for RenameProduct {
    type Args = RenameArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "renameProduct"
    }

    fn policy(&self, args: &RenameArgs) -> Policy {
        let id = args.id.clone();
        Policy::every(vec![
            Policy::some(vec![
                Policy::permission("products:update"),
                product_room_editor(args.id.clone()),
            ]),
            Policy::state("published products cannot be renamed", move |_, reader| {
                Ok(reader
                    .find("products", &id)
                    .is_some_and(|row| row.field_str("status") != Some("published")))
            }),
        ])
    }

    fn execute(&self, args: &RenameArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        let patch = EntityPatch::new()
            .set("name", json!(args.name))
            .expect_updated_at(args.updated_at);
        ctx.tx().update_by_id("products", &args.id, patch)
    }
}

/// Soft delete. An actor who cannot read archived products would be left
/// with a row it can never see again, so it is removed outright instead.
pub struct ArchiveProduct;

impl Procedure for ArchiveProduct {
    type Args = ProductArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "archiveProduct"
    }

    fn policy(&self, args: &ProductArgs) -> Policy {
        let id = args.id.clone();
        Policy::every(vec![
            Policy::some(vec![
                Policy::permission("products:delete"),
                product_room_editor(args.id.clone()),
            ]),
            Policy::state("archived product is no longer visible to the actor", move |principal, reader| {
                Ok(principal.has_permission("products:read")
                    || reader.find("products", &id).is_some_and(|row| row.is_active()))
            })
            .tagged("read_visibility"),
        ])
    }

    fn execute(&self, args: &ProductArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        let patch = patch_with_token(EntityPatch::new().soft_delete(tenant_sync::entity::now_millis()), args.updated_at);
        ctx.tx().update_by_id("products", &args.id, patch)
    }

    fn fallbacks(&self) -> Vec<Fallback<Self>> {
        vec![Fallback::hard_delete("products", "read_visibility")]
    }
}

#[derive(Debug, Deserialize)]
pub struct GetArgs {
    pub id: EntityId,
}

pub struct GetProduct;

impl Procedure for GetProduct {
    type Args = GetArgs;
    type Returns = Entity;

    fn name(&self) -> &'static str {
        "getProduct"
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::Query
    }

    fn policy(&self, args: &GetArgs) -> Policy {
        let id = args.id.clone();
        Policy::some(vec![
            Policy::permission("products:read"),
            Policy::relationship("product is not published", move |principal, reader| {
                let view = ViewDescriptor::new(
                    "published_products",
                    "products",
                    Visibility::And(vec![
                        Visibility::Active,
                        Visibility::field_equals("status", "published"),
                        Visibility::parent_visible("rooms", "roomId", published_room()),
                    ]),
                );
                Ok(view.find_by_id(reader, principal, &id).is_some())
            }),
        ])
    }

    fn execute(&self, args: &GetArgs, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
        ctx.tx().find_by_id("products", &args.id)
    }
}

pub fn procedures() -> ProcedureRegistry {
    let mut registry = ProcedureRegistry::new();
    registry
        .register(CreateRoom)
        .unwrap()
        .register(GrantRoomEditor)
        .unwrap()
        .register(CreateProduct)
        .unwrap()
        .register(PublishProduct)
        .unwrap()
        .register(DraftProduct)
        .unwrap()
        .register(RenameProduct)
        .unwrap()
        .register(ArchiveProduct)
        .unwrap()
        .register(GetProduct)
        .unwrap();
    registry
}

// =============================================================================
// Server
// =============================================================================

pub fn test_config() -> SyncConfig {
    SyncConfig {
        request_timeout_ms: 5_000,
        pull_concurrency: 4,
        ..Default::default()
    }
}

pub fn server(store: Arc<dyn EntityStore>) -> SyncServer {
    server_with(store, test_config(), Arc::new(NoopNotifier))
}

/// Log to the test writer; `RUST_LOG=tenant_sync=debug` for detail.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tenant_sync=warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn server_with(store: Arc<dyn EntityStore>, config: SyncConfig, notifier: Arc<dyn Notifier>) -> SyncServer {
    init_tracing();
    SyncServer::new(store, views(), procedures(), notifier, config).unwrap()
}

pub async fn dispatch(server: &SyncServer, actor: &Principal, name: &str, args: Value) -> Result<Entity, SyncError> {
    server
        .dispatcher()
        .dispatch_as(actor, name, args.into())
        .await
}

/// Room r1 (published) with product p1 (draft) and p2 (published).
pub async fn seed(server: &SyncServer) {
    let admin = admin();
    dispatch(server, &admin, "createRoom", json!({"id": "r1", "name": "Print Lab"})).await.unwrap();
    dispatch(server, &admin, "createProduct", json!({"id": "p1", "roomId": "r1", "name": "Poster"}))
        .await
        .unwrap();
    dispatch(server, &admin, "createProduct", json!({"id": "p2", "roomId": "r1", "name": "Flyer"}))
        .await
        .unwrap();
    dispatch(server, &admin, "publishProduct", json!({"id": "p2"})).await.unwrap();
}

// =============================================================================
// Replica
// =============================================================================

/// One client of one client group, holding what its pulls delivered.
#[derive(Debug, Clone)]
pub struct Replica {
    pub group_id: String,
    pub client_id: String,
    pub cookie: Option<Cookie>,
    pub rows: BTreeMap<String, Value>,
    pub last_mutation_id: u64,
    next_mutation_id: u64,
}

impl Replica {
    pub fn new(group_id: &str, client_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            client_id: client_id.to_string(),
            cookie: None,
            rows: BTreeMap::new(),
            last_mutation_id: 0,
            next_mutation_id: 1,
        }
    }

    pub fn apply(&mut self, result: &PullResult) {
        for op in &result.patch {
            match op {
                PatchOperation::Clear => self.rows.clear(),
                PatchOperation::Put { key, value } => {
                    self.rows.insert(key.clone(), value.clone());
                }
                PatchOperation::Del { key } => {
                    self.rows.remove(key);
                }
            }
        }
        if let Some(lmid) = result.last_mutation_id_changes.get(&self.client_id) {
            self.last_mutation_id = *lmid;
        }
        self.cookie = Some(result.cookie);
    }

    pub async fn pull(&mut self, server: &SyncServer, actor: &Principal) -> PullResult {
        let request = PullRequest::new(self.group_id.clone(), self.cookie);
        match server.pull(actor, request).await.unwrap() {
            PullResponse::Ok(result) => {
                self.apply(&result);
                result
            }
            PullResponse::Error(err) => panic!("pull refused: {:?}", err),
        }
    }

    /// Pull until the server reports nothing deferred.
    pub async fn sync(&mut self, server: &SyncServer, actor: &Principal) {
        for _ in 0..100 {
            let result = self.pull(server, actor).await;
            if !result.is_partial() {
                return;
            }
        }
        panic!("replica {} never completed", self.group_id);
    }

    pub fn mutation(&mut self, name: &str, args: Value) -> Mutation {
        let id = self.next_mutation_id;
        self.next_mutation_id += 1;
        Mutation {
            client_id: self.client_id.clone(),
            id,
            name: name.to_string(),
            args,
            timestamp: 0.0,
        }
    }

    pub async fn push(&mut self, server: &SyncServer, actor: &Principal, mutations: Vec<Mutation>) -> PushResult {
        let request = PushRequest::new(self.group_id.clone(), mutations);
        match server.push(actor, request).await.unwrap() {
            PushResponse::Ok(result) => result,
            PushResponse::Error(err) => panic!("push refused: {:?}", err),
        }
    }

    /// Ids held under one view.
    pub fn ids(&self, view: &str) -> Vec<String> {
        let prefix = format!("{}/", view);
        self.rows
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn row(&self, view: &str, id: &str) -> Option<&Value> {
        self.rows.get(&format!("{}/{}", view, id))
    }

    pub fn is_complete(&self) -> bool {
        self.rows.get(SYNC_STATE_KEY) == Some(&json!("COMPLETE"))
    }

    /// Everything but the sync-state entry.
    pub fn data_rows(&self) -> BTreeMap<String, Value> {
        self.rows
            .iter()
            .filter(|(key, _)| key.as_str() != SYNC_STATE_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// What a fully synced replica of `actor` must hold right now.
pub async fn expected_rows(server: &SyncServer, actor: &Principal) -> BTreeMap<String, Value> {
    let snapshot = server.store().snapshot(&actor.tenant_id).await.unwrap();
    let permitted = server.views().pull_permissions(actor);
    let mut rows = BTreeMap::new();
    for view in server.views().iter().filter(|v| permitted.contains(&v.name())) {
        for row in view.find_all(snapshot.as_ref(), actor) {
            rows.insert(view.key(&row.id), row.to_dto());
        }
    }
    rows
}
