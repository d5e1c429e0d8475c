//! Tests for the Resource Manager client against a mock HTTP server

#[cfg(test)]
mod arm_client_tests {
    use crate::compute::{
        ArmClient, ArmClientConfig, ComputeProvider, CredentialChain, PollConfig, ProviderError,
        TokenSource,
    };
    use crate::compute::azure::DEFAULT_API_VERSION;
    use crate::settings::ResourceTarget;
    use mockito::{Matcher, Server, ServerGuard};
    use reqwest::Client;
    use std::sync::Arc;
    use std::time::Duration;

    const VM_COLLECTION: &str =
        "/subscriptions/sub-1/resourceGroups/rg-dev/providers/Microsoft.Compute/virtualMachines";

    fn api_version() -> Matcher {
        Matcher::UrlEncoded("api-version".into(), DEFAULT_API_VERSION.into())
    }

    fn client_for(server: &ServerGuard) -> ArmClient {
        let http = Client::new();
        let credential = Arc::new(CredentialChain::new(
            TokenSource::Static("test-token".to_string()),
            http.clone(),
        ));
        let config = ArmClientConfig {
            endpoint: server.url(),
            poll: PollConfig {
                default_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(10),
                timeout: Duration::from_millis(200),
            },
            ..ArmClientConfig::default()
        };
        let target = ResourceTarget {
            subscription_id: "sub-1".to_string(),
            resource_group: "rg-dev".to_string(),
        };

        ArmClient::new(http, credential, target, &config).unwrap()
    }

    #[tokio::test]
    async fn test_list_vms_single_page() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", VM_COLLECTION)
            .match_query(api_version())
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"value":[
                    {"name":"web-1","location":"westeurope","tags":{"AutoShutdown":"true"}},
                    {"name":"db-1","location":"westeurope"}
                ]}"#,
            )
            .create_async()
            .await;

        let vms = client_for(&server).list_vms().await.unwrap();

        mock.assert_async().await;
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].name, "web-1");
        assert_eq!(vms[0].tag("AutoShutdown"), Some("true"));
        assert!(vms[1].tags.is_none());
    }

    #[tokio::test]
    async fn test_list_vms_follows_next_link() {
        let mut server = Server::new_async().await;
        let next_link = format!("{}/page-2?api-version=2024-07-01&skiptoken=abc", server.url());

        let first = server
            .mock("GET", VM_COLLECTION)
            .match_query(api_version())
            .with_status(200)
            .with_body(format!(
                r#"{{"value":[{{"name":"web-1"}}],"nextLink":"{}"}}"#,
                next_link
            ))
            .create_async()
            .await;
        let second = server
            .mock("GET", "/page-2")
            .match_query(Matcher::UrlEncoded("skiptoken".into(), "abc".into()))
            .with_status(200)
            .with_body(r#"{"value":[{"name":"web-2"}]}"#)
            .create_async()
            .await;

        let vms = client_for(&server).list_vms().await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        let names: Vec<_> = vms.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, vec!["web-1", "web-2"]);
    }

    #[tokio::test]
    async fn test_list_vms_authentication_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", VM_COLLECTION)
            .match_query(api_version())
            .with_status(401)
            .with_body(r#"{"error":{"code":"InvalidAuthenticationToken","message":"expired"}}"#)
            .create_async()
            .await;

        let err = client_for(&server).list_vms().await.unwrap_err();

        match err {
            ProviderError::Authentication(message) => {
                assert!(message.contains("InvalidAuthenticationToken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_power_state_from_instance_view() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", format!("{}/web-1/instanceView", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(200)
            .with_body(
                r#"{"statuses":[
                    {"code":"ProvisioningState/succeeded","displayStatus":"Provisioning succeeded"},
                    {"code":"PowerState/running","displayStatus":"VM running"}
                ]}"#,
            )
            .create_async()
            .await;

        let state = client_for(&server).power_state("web-1").await.unwrap();

        assert!(state.is_running());
        assert_eq!(state.code(), Some("PowerState/running"));
    }

    #[tokio::test]
    async fn test_power_state_error_mapping() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", format!("{}/gone/instanceView", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(404)
            .with_body(r#"{"error":{"code":"ResourceNotFound","message":"not found"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", format!("{}/busy/instanceView", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(429)
            .with_header("retry-after", "17")
            .create_async()
            .await;
        server
            .mock("GET", format!("{}/broken/instanceView", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(500)
            .with_body(r#"{"error":{"code":"InternalServerError","message":"boom"}}"#)
            .create_async()
            .await;

        let client = client_for(&server);

        assert!(matches!(
            client.power_state("gone").await,
            Err(ProviderError::NotFound { ref resource }) if resource == "gone"
        ));
        assert!(matches!(
            client.power_state("busy").await,
            Err(ProviderError::Throttled {
                retry_after_secs: Some(17)
            })
        ));
        match client.power_state("broken").await {
            Err(err @ ProviderError::Http { .. }) => {
                assert!(err.is_transient());
                assert!(err.to_string().contains("InternalServerError"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deallocate_completes_synchronously() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", format!("{}/web-1/deallocate", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(200)
            .create_async()
            .await;

        client_for(&server).deallocate("web-1").await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_polls_async_operation() {
        let mut server = Server::new_async().await;
        let status_url = format!("{}/operations/op-1", server.url());

        let accepted = server
            .mock("POST", format!("{}/web-1/start", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(202)
            .with_header("azure-asyncoperation", &status_url)
            .create_async()
            .await;
        let status = server
            .mock("GET", "/operations/op-1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"Succeeded"}"#)
            .create_async()
            .await;

        client_for(&server).start("web-1").await.unwrap();

        accepted.assert_async().await;
        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_location_polling_completion() {
        let mut server = Server::new_async().await;
        let location = format!("{}/locations/op-2", server.url());

        server
            .mock("POST", format!("{}/web-1/deallocate", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(202)
            .with_header("location", &location)
            .create_async()
            .await;
        let poll = server
            .mock("GET", "/locations/op-2")
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        client_for(&server).deallocate("web-1").await.unwrap();

        poll.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_operation_is_reported() {
        let mut server = Server::new_async().await;
        let status_url = format!("{}/operations/op-3", server.url());

        server
            .mock("POST", format!("{}/web-1/deallocate", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(202)
            .with_header("azure-asyncoperation", &status_url)
            .create_async()
            .await;
        server
            .mock("GET", "/operations/op-3")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"status":"Failed","error":{"code":"OperationNotAllowed","message":"locked"}}"#,
            )
            .create_async()
            .await;

        let err = client_for(&server).deallocate("web-1").await.unwrap_err();

        match err {
            ProviderError::OperationFailed { operation, vm, status } => {
                assert_eq!(operation, "deallocate");
                assert_eq!(vm, "web-1");
                assert!(status.contains("OperationNotAllowed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let mut server = Server::new_async().await;
        let status_url = format!("{}/operations/op-4", server.url());

        server
            .mock("POST", format!("{}/web-1/start", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(202)
            .with_header("azure-asyncoperation", &status_url)
            .create_async()
            .await;
        server
            .mock("GET", "/operations/op-4")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"InProgress"}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let err = client_for(&server).start("web-1").await.unwrap_err();

        assert!(matches!(err, ProviderError::OperationTimedOut { .. }));
    }

    #[tokio::test]
    async fn test_next_link_to_other_origin_is_refused() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", VM_COLLECTION)
            .match_query(api_version())
            .with_status(200)
            .with_body(
                r#"{"value":[{"name":"web-1"}],"nextLink":"http://attacker.invalid/page-2?api-version=2024-07-01"}"#,
            )
            .create_async()
            .await;

        let err = client_for(&server).list_vms().await.unwrap_err();

        first.assert_async().await;
        match err {
            ProviderError::UntrustedUrl { url } => assert!(url.starts_with("http://attacker.invalid/")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_operation_url_on_other_origin_is_refused() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", format!("{}/web-1/start", VM_COLLECTION).as_str())
            .match_query(api_version())
            .with_status(202)
            .with_header("azure-asyncoperation", "https://elsewhere.invalid/operations/op-5")
            .create_async()
            .await;

        let err = client_for(&server).start("web-1").await.unwrap_err();

        assert!(matches!(err, ProviderError::UntrustedUrl { .. }));
        assert!(!err.is_transient());
    }
}
