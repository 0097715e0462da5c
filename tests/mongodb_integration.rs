//! MongoDB Backend Tests
//!
//! Runs the session handles against a real MongoDB server started in a
//! container. Requires Docker and the `mongodb` feature.

#![cfg(feature = "mongodb")]

use bson::{Document, doc};
use mongo_resilient::{Change, CollectionInfo, Error, Index, Mode, Session};
use mongo_resilient_test::{MongoServer, mongodb_server};
use rstest::rstest;
use serial_test::serial;
use std::time::Duration;

async fn connect(server: &MongoServer, database: &str) -> Session {
	Session::connect(&server.target(database, 3))
		.await
		.expect("Failed to connect to MongoDB")
}

/// Test connecting and answering pings
///
/// This test verifies that:
/// 1. The connect target is parsed and dialed
/// 2. `ping` and `build_info` reach the server
#[rstest]
#[tokio::test]
#[serial(mongodb)]
async fn test_connect_and_ping(#[future] mongodb_server: MongoServer) {
	// Arrange
	let server = mongodb_server.await;

	// Act
	let session = connect(&server, "resilient_ping").await;
	let info = session.build_info().await.unwrap();

	// Assert
	assert_eq!(session.max_retries(), 3);
	session.ping().await.unwrap();
	assert!(info.version_at_least(&[7]));
	session.close().await;
	assert!(matches!(session.ping().await, Err(Error::SessionClosed)));
}

/// Test basic writes and queries
///
/// This test verifies that:
/// 1. Inserted documents can be queried back with sort and projection
/// 2. Updates and removals report their effect
#[rstest]
#[tokio::test]
#[serial(mongodb)]
async fn test_insert_query_update_remove(#[future] mongodb_server: MongoServer) {
	// Arrange
	let server = mongodb_server.await;
	let session = connect(&server, "resilient_crud").await;
	let people = session.collection("people");
	people
		.insert(&[
			doc! { "_id": 1, "name": "Ada", "age": 36 },
			doc! { "_id": 2, "name": "Alan", "age": 41 },
			doc! { "_id": 3, "name": "Grace", "age": 85 },
		])
		.await
		.unwrap();

	// Act
	let names: Vec<Document> = people
		.find(&doc! { "age": { "$gt": 40 } })
		.sort(["-age"])
		.select(&doc! { "_id": 0, "name": 1 })
		.all()
		.await
		.unwrap();
	let updated = people
		.update_all(&doc! {}, &doc! { "$inc": { "age": 1 } })
		.await
		.unwrap();
	people.remove_id(&2).await.unwrap();

	// Assert
	assert_eq!(names, vec![doc! { "name": "Grace" }, doc! { "name": "Alan" }]);
	assert_eq!(updated.updated, 3);
	assert_eq!(people.count().await.unwrap(), 2);
	assert!(matches!(people.remove_id(&2).await, Err(Error::NotFound)));

	people.drop_collection().await.unwrap();
	session.close().await;
}

#[rstest]
#[tokio::test]
#[serial(mongodb)]
async fn test_unique_index(#[future] mongodb_server: MongoServer) {
	let server = mongodb_server.await;
	let session = connect(&server, "resilient_index").await;
	let users = session.collection("users");

	users
		.ensure_index(Index::new(["email"]).unique(true))
		.await
		.unwrap();
	users.insert(&[doc! { "email": "ada@example.com" }]).await.unwrap();
	let err = users
		.insert(&[doc! { "email": "ada@example.com" }])
		.await
		.unwrap_err();
	let names: Vec<String> = users
		.indexes()
		.await
		.unwrap()
		.iter()
		.map(|index| index.key_name().unwrap())
		.collect();

	assert!(err.is_duplicate_key());
	assert!(names.contains(&"_id_".to_string()));
	assert!(names.contains(&"email_1".to_string()));

	users.drop_collection().await.unwrap();
	session.close().await;
}

#[rstest]
#[tokio::test]
#[serial(mongodb)]
async fn test_cursor_batches_and_apply(#[future] mongodb_server: MongoServer) {
	let server = mongodb_server.await;
	let session = connect(&server, "resilient_cursor").await;
	let numbers = session.collection("numbers");
	let docs: Vec<Document> = (0..25).map(|n| doc! { "_id": n, "n": n }).collect();
	numbers.insert(&docs).await.unwrap();

	let mut cursor = numbers.find(&doc! {}).sort(["_id"]).batch(10).iter();
	let mut seen = 0;
	while let Some(_doc) = cursor.next::<Document>().await {
		seen += 1;
	}
	assert!(cursor.err().is_none());
	cursor.close().await.unwrap();

	let (info, after) = numbers
		.find_id(&7)
		.apply::<Document>(Change::update(doc! { "$set": { "n": 70 } }).with_return_new(true))
		.await
		.unwrap();

	assert_eq!(seen, 25);
	assert_eq!(info.updated, 1);
	assert_eq!(after.unwrap().get_i32("n").unwrap(), 70);

	numbers.drop_collection().await.unwrap();
	session.close().await;
}

#[rstest]
#[tokio::test]
#[serial(mongodb)]
async fn test_refresh_keeps_session_usable(#[future] mongodb_server: MongoServer) {
	let server = mongodb_server.await;
	let session = connect(&server, "resilient_refresh").await;
	let log = session.collection("log");
	log.create(&CollectionInfo::capped(1 << 20, 100)).await.unwrap();
	log.insert(&[doc! { "n": 1 }]).await.unwrap();

	session.refresh().await;
	session.set_mode(Mode::PrimaryPreferred, true).await;

	let mut tail = log
		.find(&doc! {})
		.tail(Some(Duration::from_millis(500)));
	let first: Option<Document> = tail.next().await;
	let idle: Option<Document> = tail.next().await;

	assert_eq!(first.unwrap().get_i32("n").unwrap(), 1);
	assert!(idle.is_none());
	assert!(tail.timeout());
	tail.close().await.unwrap();

	log.drop_collection().await.unwrap();
	session.close().await;
}
