//! End-to-end scenarios against the canned-response api.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{database, FakeApi};
use rest_models::{
    error::RestError,
    query::{
        ColumnRef, DeleteQuery, FilePayload, InsertObject, InsertQuery, JoinEntry, Lookup,
        LookupOp, Query, Rhs, UpdateQuery, WhereNode, WherePart,
    },
    value::DbValue,
    ApiConnection, RestDatabase,
};

fn pizza_query() -> Query {
    Query::base("Pizza")
}

fn exact(alias: &str, field: &str, value: serde_json::Value) -> WhereNode {
    WhereNode::and(vec![WherePart::Leaf(Lookup::exact(
        ColumnRef::column(alias, field),
        value,
    ))])
}

#[test]
fn single_key_reads_address_the_row() {
    let api = FakeApi::new();
    api.push(200, json!({"pizza": {"id": 1, "name": "suprème"}}));
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![
        ColumnRef::column("Pizza", "id"),
        ColumnRef::column("Pizza", "name"),
    ];
    query.where_clause = exact("Pizza", "id", json!(1));

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(
        rows,
        vec![vec![DbValue::Int(1), DbValue::Text("suprème".to_owned())]]
    );

    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert!(requests[0].url.ends_with("/pizza/1/"));
    assert_eq!(requests[0].param_values("exclude[]"), vec!["*"]);
    assert_eq!(requests[0].param_values("include[]"), vec!["id", "name"]);
}

#[test]
fn unresolvable_key_predicates_pre_look_up_ids() {
    let api = FakeApi::new();
    api.push(200, json!({"pizzas": [{"id": 1}, {"id": 3}]}));
    api.push(200, json!({"pizzas": [{"id": 1, "name": "x"}, {"id": 3, "name": "x"}]}));
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "id")];
    query.where_clause = WhereNode::and(vec![
        WherePart::Leaf(Lookup::is_in(
            ColumnRef::column("Pizza", "id"),
            vec![json!(1), json!(3)],
        )),
        WherePart::Leaf(Lookup::exact(ColumnRef::column("Pizza", "name"), json!("x"))),
    ]);

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(rows, vec![vec![DbValue::Int(1)], vec![DbValue::Int(3)]]);

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    // the pre-lookup asks for keys only, under the same filters
    assert_eq!(requests[0].param_values("include[]"), vec!["id"]);
    assert_eq!(requests[0].param_values("exclude[]"), vec!["*"]);
    assert_eq!(requests[0].param_values("filter{id.in}"), vec!["1", "3"]);
    assert_eq!(requests[0].param_values("filter{name}"), vec!["x"]);
    assert_eq!(requests[1].param_values("filter{name}"), vec!["x"]);
}

#[test]
fn a_pre_lookup_finding_one_key_reads_the_row_directly() {
    let api = FakeApi::new();
    api.push(200, json!({"pizzas": [{"id": 3}]}));
    api.push(200, json!({"pizza": {"id": 3, "name": "x"}}));
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "name")];
    query.where_clause = WhereNode::and(vec![
        WherePart::Leaf(Lookup::is_in(
            ColumnRef::column("Pizza", "id"),
            vec![json!(3), json!(9)],
        )),
        WherePart::Leaf(Lookup::exact(ColumnRef::column("Pizza", "name"), json!("x"))),
    ]);

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(rows, vec![vec![DbValue::Text("x".to_owned())]]);
    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].url.ends_with("/pizza/3/"));
}

#[test]
fn missing_single_row_reads_empty() {
    let api = FakeApi::new();
    api.push(404, json!({"detail": "not found"}));
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "id")];
    query.where_clause = exact("Pizza", "id", json!(99));

    assert!(db.select_rows(&query).unwrap().is_empty());
    assert_eq!(api.requests().len(), 1);
}

#[test]
fn to_many_relations_fan_rows_out() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({
            "pizzas": [{"id": 1, "toppings": [1, 2, 3]}],
            "toppings": [
                {"id": 1, "name": "mushroom"},
                {"id": 2, "name": "olive"},
                {"id": 3, "name": "ham"}
            ]
        }),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.joins = vec![
        JoinEntry::base("T1", "Pizza"),
        JoinEntry::joined("T2", "PizzaTopping", "T1", "pizzatopping_set"),
        JoinEntry::joined("T3", "Topping", "T2", "topping"),
    ];
    query.select = vec![
        ColumnRef::column("T1", "id"),
        ColumnRef::column("T3", "name"),
    ];

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![DbValue::Int(1), DbValue::Text("mushroom".to_owned())],
            vec![DbValue::Int(1), DbValue::Text("olive".to_owned())],
            vec![DbValue::Int(1), DbValue::Text("ham".to_owned())],
        ]
    );
    // the filter paths and includes address the collapsed relation
    let requests = api.requests();
    assert!(requests[0]
        .param_values("include[]")
        .contains(&"toppings.name"));
}

#[test]
fn null_relations_dangle_as_null_cells() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({"pizzas": [{"id": 1, "name": "solo", "menu": null}]}),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.joins = vec![
        JoinEntry::base("T1", "Pizza"),
        JoinEntry::joined("T2", "Menu", "T1", "menu"),
    ];
    query.select = vec![
        ColumnRef::column("T1", "name"),
        ColumnRef::column("T2", "name"),
    ];

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(
        rows,
        vec![vec![DbValue::Text("solo".to_owned()), DbValue::Null]]
    );
}

#[test]
fn auxiliary_collections_resolve_relation_keys() {
    let api = FakeApi::new();
    // related rows outside the requested window come back under the
    // +-prefixed key
    api.push(
        200,
        json!({
            "pizzas": [{"id": 1, "menu": 7}],
            "+menus": [{"id": 7, "name": "hidden"}]
        }),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.joins = vec![
        JoinEntry::base("T1", "Pizza"),
        JoinEntry::joined("T2", "Menu", "T1", "menu"),
    ];
    query.select = vec![ColumnRef::column("T2", "name")];

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(rows, vec![vec![DbValue::Text("hidden".to_owned())]]);
}

#[test]
fn a_member_missing_from_the_collections_is_an_error() {
    let api = FakeApi::new();
    api.push(200, json!({"pizzas": [{"id": 1, "toppings": [7]}]}));
    let db = database(&api);

    let mut query = pizza_query();
    query.joins = vec![
        JoinEntry::base("T1", "Pizza"),
        JoinEntry::joined("T2", "PizzaTopping", "T1", "pizzatopping_set"),
        JoinEntry::joined("T3", "Topping", "T2", "topping"),
    ];
    query.select = vec![ColumnRef::column("T3", "name")];

    match db.select_rows(&query) {
        Err(RestError::MissingId { model, pk }) => {
            assert_eq!(model, "Topping");
            assert_eq!(pk, "7");
        }
        other => panic!("expected a missing id error, got {:?}", other),
    }
}

#[test]
fn pagination_stitches_pages_while_pulled() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({
            "meta": {"page": 1, "per_page": 2, "total_pages": 2, "total_results": 3},
            "pizzas": [{"id": 1}, {"id": 2}]
        }),
    );
    api.push(
        200,
        json!({
            "meta": {"page": 2, "per_page": 2, "total_pages": 2, "total_results": 3},
            "pizzas": [{"id": 3}]
        }),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "id")];

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![DbValue::Int(1)],
            vec![DbValue::Int(2)],
            vec![DbValue::Int(3)],
        ]
    );
    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].param_values("page"), vec!["2"]);
}

#[test]
fn the_window_caps_pagination() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({
            "meta": {"page": 1, "per_page": 2, "total_pages": 3, "total_results": 6},
            "pizzas": [{"id": 1}, {"id": 2}]
        }),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "id")];
    query.high_mark = Some(2);

    let rows = db.select_rows(&query).unwrap();
    assert_eq!(rows.len(), 2);
    // pages past the window are never requested
    assert_eq!(api.requests().len(), 1);
}

#[test]
fn a_clamped_page_size_still_covers_the_window() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({
            "meta": {"page": 1, "per_page": 2, "total_pages": 3, "total_results": 6},
            "pizzas": [{"id": 1}, {"id": 2}]
        }),
    );
    api.push(
        200,
        json!({
            "meta": {"page": 2, "per_page": 2, "total_pages": 3, "total_results": 6},
            "pizzas": [{"id": 3}, {"id": 4}]
        }),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "id")];
    query.high_mark = Some(4);

    // per_page 4 was requested but the server clamped it to 2: the page
    // cap follows the size the server applied, not the requested one
    let rows = db.select_rows(&query).unwrap();
    assert_eq!(rows.len(), 4);
    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].param_values("per_page"), vec!["4"]);
    assert_eq!(requests[1].param_values("page"), vec!["2"]);
}

#[test]
fn dropping_the_stream_stops_pagination() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({
            "meta": {"page": 1, "per_page": 1, "total_pages": 5, "total_results": 5},
            "pizzas": [{"id": 1}]
        }),
    );
    let db = database(&api);

    let mut query = pizza_query();
    query.select = vec![ColumnRef::column("Pizza", "id")];

    let mut stream = db.select(&query).unwrap();
    assert!(stream.next().is_some());
    drop(stream);
    assert_eq!(api.requests().len(), 1);
}

#[test]
fn disjunctions_fail_before_any_request() {
    let api = FakeApi::new();
    let db = database(&api);

    let mut query = pizza_query();
    query.where_clause = WhereNode::or(vec![
        WherePart::Leaf(Lookup::exact(ColumnRef::column("Pizza", "id"), json!(1))),
        WherePart::Leaf(Lookup::exact(ColumnRef::column("Pizza", "id"), json!(2))),
    ]);

    assert!(matches!(
        db.select_rows(&query),
        Err(RestError::UnsupportedQuery(_))
    ));
    assert!(api.requests().is_empty());
}

#[test]
fn an_impossible_predicate_needs_no_request() {
    let api = FakeApi::new();
    let db = database(&api);

    let mut query = pizza_query();
    query.where_clause = WhereNode::and(vec![WherePart::Nothing]);

    assert!(db.select_rows(&query).unwrap().is_empty());
    assert!(api.requests().is_empty());
}

#[test]
fn selecting_nothing_counts_records() {
    let api = FakeApi::new();
    api.push(200, json!({"pizzas": [{"id": 1}, {"id": 2}]}));
    let db = database(&api);

    let rows = db.select_rows(&pizza_query()).unwrap();
    assert_eq!(rows, vec![Vec::new(), Vec::new()]);
}

#[test]
fn bulk_inserts_merge_created_rows_in_order() {
    let api = FakeApi::new();
    api.push(201, json!({"pizzas": [{"id": 10}, {"id": 11}]}));
    let db = database(&api);

    let objs = vec![
        InsertObject {
            data: [("name".to_owned(), json!("one"))].into_iter().collect(),
            ..Default::default()
        },
        InsertObject {
            data: [("name".to_owned(), json!("two"))].into_iter().collect(),
            ..Default::default()
        },
    ];
    let created = db
        .insert(&InsertQuery {
            model: "Pizza".to_owned(),
            objs,
            return_id: false,
        })
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0]["id"], DbValue::Int(10));
    assert_eq!(created[1]["id"], DbValue::Int(11));

    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].json,
        Some(json!({"pizzas": [{"name": "one"}, {"name": "two"}]}))
    );
}

#[test]
fn single_inserts_merge_server_fields_back() {
    let api = FakeApi::new();
    api.push(201, json!({"pizza": {"id": 5, "name": "new", "price": "9.5"}}));
    let db = database(&api);

    let created = db
        .insert(&InsertQuery {
            model: "Pizza".to_owned(),
            objs: vec![InsertObject {
                data: [("name".to_owned(), json!("new"))].into_iter().collect(),
                ..Default::default()
            }],
            return_id: true,
        })
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["id"], DbValue::Int(5));
    assert_eq!(created[0]["name"], DbValue::Text("new".to_owned()));
    // fields the server filled in come back natively typed
    assert_eq!(created[0]["price"], DbValue::Float(9.5));
    assert_eq!(
        api.requests()[0].json,
        Some(json!({"pizza": {"name": "new"}}))
    );
}

#[test]
fn file_bearing_inserts_upload_before_patching() {
    let api = FakeApi::new();
    api.push(201, json!({"pizza": {"id": 7}}));
    api.push(200, json!({"pizza": {"id": 7, "name": "new"}}));
    let db = database(&api);

    let created = db
        .insert(&InsertQuery {
            model: "Pizza".to_owned(),
            objs: vec![InsertObject {
                data: [("name".to_owned(), json!("new"))].into_iter().collect(),
                files: [(
                    "photo".to_owned(),
                    FilePayload {
                        filename: "photo.png".to_owned(),
                        content_type: "image/png".to_owned(),
                        content: vec![1, 2, 3],
                    },
                )]
                .into_iter()
                .collect(),
            }],
            return_id: true,
        })
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    // the multipart body creates the record, the data refines it
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].json, None);
    assert_eq!(requests[1].method, "PATCH");
    assert!(requests[1].url.ends_with("/pizza/7/"));
    assert_eq!(
        requests[1].json,
        Some(json!({"pizza": {"name": "new"}}))
    );
    assert_eq!(created[0]["name"], DbValue::Text("new".to_owned()));
}

#[test]
fn association_inserts_union_the_member_list() {
    let api = FakeApi::new();
    api.push(200, json!({"pizza": {"id": 1, "toppings": [1]}}));
    api.push(204, json!(null));
    let db = database(&api);

    db.insert(&InsertQuery {
        model: "PizzaTopping".to_owned(),
        objs: vec![InsertObject {
            data: [
                ("pizza".to_owned(), json!(1)),
                ("topping".to_owned(), json!(5)),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        }],
        return_id: false,
    })
    .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].param_values("include[]"), vec!["toppings"]);
    assert_eq!(requests[1].method, "PATCH");
    assert!(requests[1].url.ends_with("/pizza/1/"));
    assert_eq!(
        requests[1].json,
        Some(json!({"pizza": {"toppings": [1, 5]}}))
    );
}

#[test]
fn association_deletes_prune_the_member_list() {
    let api = FakeApi::new();
    api.push(200, json!({"pizza": {"id": 1, "toppings": [1, 4, 6]}}));
    api.push(204, json!(null));
    let db = database(&api);

    let removed = db
        .delete(&DeleteQuery {
            model: "PizzaTopping".to_owned(),
            joins: Vec::new(),
            where_clause: WhereNode::and(vec![
                WherePart::Leaf(Lookup::exact(
                    ColumnRef::column("PizzaTopping", "pizza"),
                    json!(1),
                )),
                WherePart::Leaf(Lookup::is_in(
                    ColumnRef::column("PizzaTopping", "topping"),
                    vec![json!(4), json!(6)],
                )),
            ]),
        })
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(
        api.requests()[1].json,
        Some(json!({"pizza": {"toppings": [1]}}))
    );
}

#[test]
fn association_deletes_without_members_clear_the_relation() {
    let api = FakeApi::new();
    api.push(200, json!({"pizza": {"id": 1, "toppings": [1, 4]}}));
    api.push(204, json!(null));
    let db = database(&api);

    let removed = db
        .delete(&DeleteQuery {
            model: "PizzaTopping".to_owned(),
            joins: Vec::new(),
            where_clause: exact("PizzaTopping", "pizza", json!(1)),
        })
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(
        api.requests()[1].json,
        Some(json!({"pizza": {"toppings": []}}))
    );
}

#[test]
fn association_deletes_without_an_owner_cascade_on_the_api() {
    let api = FakeApi::new();
    let db = database(&api);

    // no single owning row is pinned: the owning rows themselves are being
    // deleted and the api cleans their association rows up, so no request
    // is needed
    let removed = db
        .delete(&DeleteQuery {
            model: "PizzaTopping".to_owned(),
            joins: Vec::new(),
            where_clause: WhereNode::and(vec![WherePart::Leaf(Lookup::is_in(
                ColumnRef::column("PizzaTopping", "pizza"),
                vec![json!(1), json!(2)],
            ))]),
        })
        .unwrap();
    assert_eq!(removed, 0);
    assert!(api.requests().is_empty());
}

#[test]
fn updates_patch_each_selected_row() {
    let api = FakeApi::new();
    api.push(
        200,
        json!({"pizza": {"id": 1, "name": "renamed", "price": "12.5"}}),
    );
    let db = database(&api);

    let merged = db
        .update(&UpdateQuery {
            model: "Pizza".to_owned(),
            joins: Vec::new(),
            where_clause: exact("Pizza", "id", json!(1)),
            values: [("name".to_owned(), json!("renamed"))].into_iter().collect(),
            files: Default::default(),
        })
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "PATCH");
    assert!(requests[0].url.ends_with("/pizza/1/"));
    assert_eq!(
        requests[0].json,
        Some(json!({"pizza": {"name": "renamed"}}))
    );
    // the merged representation comes back natively typed
    assert_eq!(merged[0]["name"], DbValue::Text("renamed".to_owned()));
    assert_eq!(merged[0]["price"], DbValue::Float(12.5));
}

#[test]
fn deletes_resolve_keys_then_delete_each_row() {
    let api = FakeApi::new();
    api.push(200, json!({"pizzas": [{"id": 1}, {"id": 2}]}));
    api.push(204, json!(null));
    api.push(204, json!(null));
    let db = database(&api);

    let removed = db
        .delete(&DeleteQuery {
            model: "Pizza".to_owned(),
            joins: Vec::new(),
            where_clause: WhereNode::and(vec![WherePart::Leaf(Lookup {
                lhs: ColumnRef::column("Pizza", "name"),
                op: LookupOp::IContains,
                rhs: Rhs::Value(json!("egg")),
            })]),
        })
        .unwrap();
    assert_eq!(removed, 2);

    let requests = api.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].param_values("filter{name.icontains}"),
        vec!["egg"]
    );
    assert_eq!(requests[0].param_values("exclude[]"), vec!["*"]);
    assert_eq!(requests[0].param_values("include[]"), vec!["id"]);
    assert!(requests[1].url.ends_with("/pizza/1/"));
    assert!(requests[2].url.ends_with("/pizza/2/"));
}

#[test]
fn access_denied_names_the_principal() {
    let api = FakeApi::new();
    api.push(403, json!({"detail": "credentials were not provided"}));
    let connection = ApiConnection::new("http://localapi/v2")
        .unwrap()
        .with_auth(rest_models::Auth::Basic {
            username: "pinkie".to_owned(),
            password: "hunter2".to_owned(),
        });
    let middleware: std::sync::Arc<dyn rest_models::transport::middleware::Middleware> =
        std::sync::Arc::clone(&api) as _;
    connection.middlewares().push(0, middleware);
    let db = RestDatabase::new(connection, common::catalog());

    match db.select_rows(&pizza_query()) {
        Err(RestError::AccessDenied { principal, .. }) => assert_eq!(principal, "pinkie"),
        other => panic!("expected an access denied error, got {:?}", other),
    }
}

#[test]
fn connection_errors_exhaust_the_retry_budget() {
    // nothing listens on the discard port
    let connection = ApiConnection::new("http://127.0.0.1:9")
        .unwrap()
        .with_retry(2)
        .with_timeout(Duration::from_millis(500));
    let db = RestDatabase::new(connection, common::catalog());

    match db.select_rows(&pizza_query()) {
        Err(RestError::RetriesExhausted { tries, .. }) => assert_eq!(tries, 2),
        other => panic!("expected retries exhausted, got {:?}", other),
    }
}
