#![allow(dead_code)]

//! Shared test fixtures: a canned-response middleware standing in for the
//! api, and a small pizza catalog.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::Arc,
};

use indexmap::IndexMap;
use serde_json::Value;

use rest_models::{
    schema::{FieldSchema, ModelSchema, RestSchema},
    transport::middleware::{ApiResponse, Middleware, RequestContext},
    value::ScalarType,
    ApiConnection, RestDatabase,
};

/// One request as the fake api saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub json: Option<Value>,
}

impl Recorded {
    pub fn param_values(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Serves queued responses in order and records every request. Installed as
/// a middleware, so no request ever reaches the network.
#[derive(Default)]
pub struct FakeApi {
    responses: RefCell<VecDeque<(u16, Value)>>,
    pub log: RefCell<Vec<Recorded>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeApi::default())
    }

    pub fn push(&self, status: u16, body: Value) {
        self.responses.borrow_mut().push_back((status, body));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.borrow().clone()
    }
}

impl Middleware for FakeApi {
    fn process_request(&self, ctx: &mut RequestContext, _request_id: u64) -> Option<ApiResponse> {
        self.log.borrow_mut().push(Recorded {
            method: ctx.method.clone(),
            url: ctx.url.clone(),
            params: ctx.params.clone(),
            json: ctx.json.clone(),
        });
        let (status, body) = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request: {} {}", ctx.method, ctx.url));
        Some(ApiResponse::from_json(status, &body))
    }
}

fn model(
    name: &str,
    fields: Vec<(&str, FieldSchema)>,
    link_table: bool,
) -> (String, ModelSchema) {
    (
        name.to_owned(),
        ModelSchema {
            name: name.to_owned(),
            resource_name: None,
            resource_name_plural: None,
            resource_path: None,
            primary_key: "id".to_owned(),
            fields: fields
                .into_iter()
                .map(|(n, f)| (n.to_owned(), f))
                .collect(),
            link_table,
        },
    )
}

/// the pizza catalog every scenario runs against.
pub fn catalog() -> RestSchema {
    let models: IndexMap<String, ModelSchema> = IndexMap::from_iter([
        model(
            "Pizza",
            vec![
                ("id", FieldSchema::scalar(ScalarType::Int)),
                ("name", FieldSchema::scalar(ScalarType::Text)),
                ("price", FieldSchema::scalar(ScalarType::Float)),
                ("menu", FieldSchema::foreign_key("Menu")),
                (
                    "toppings",
                    FieldSchema::many_to_many("Topping", Some("PizzaTopping")),
                ),
            ],
            false,
        ),
        model(
            "Menu",
            vec![
                ("id", FieldSchema::scalar(ScalarType::Int)),
                ("name", FieldSchema::scalar(ScalarType::Text)),
            ],
            false,
        ),
        model(
            "Topping",
            vec![
                ("id", FieldSchema::scalar(ScalarType::Int)),
                ("name", FieldSchema::scalar(ScalarType::Text)),
            ],
            false,
        ),
        model(
            "PizzaTopping",
            vec![
                ("pizza", FieldSchema::foreign_key("Pizza")),
                ("topping", FieldSchema::foreign_key("Topping")),
            ],
            true,
        ),
    ]);
    RestSchema { models }
}

/// a database wired to the fake api, never touching the network.
pub fn database(api: &Arc<FakeApi>) -> RestDatabase {
    let connection = ApiConnection::new("http://localapi/v2").unwrap();
    let middleware: Arc<dyn Middleware> = Arc::clone(api) as Arc<dyn Middleware>;
    connection.middlewares().push(0, middleware);
    RestDatabase::new(connection, catalog())
}
