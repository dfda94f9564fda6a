mod common;

use std::time::Duration;

use common::{MockProvider, output_packet, session, test_config};
use fruitstrap::{
    IdeviceError, Session, SessionState,
    cancel::CancelSource,
    utils::launch::{self, ExitStatus, ProcessEvent},
};
use futures::StreamExt;

const BUNDLE_ID: &str = "com.example.fruit";
const APP_PATH: &str = "/private/var/containers/Bundle/Application/0A1B/Example.app";

fn installed(script: Vec<String>) -> MockProvider {
    MockProvider::with_state(|s| {
        s.apps
            .insert(BUNDLE_ID.into(), (APP_PATH.into(), "Example".into()));
        s.debug_script = script;
    })
}

#[tokio::test]
async fn output_is_relayed_until_exit() {
    let provider = installed(vec![
        output_packet("hello\n"),
        output_packet("world\n"),
        "W03".into(),
    ]);
    let mut session = session(&provider).await;

    let args = vec!["-v".to_string(), "--flag=1".to_string()];
    let mut handle = launch::launch(&mut session, BUNDLE_ID, &args).await.unwrap();
    assert_eq!(handle.argv()[0], format!("{APP_PATH}/Example"));

    let mut output = Vec::new();
    {
        let stream = handle.output_stream();
        futures::pin_mut!(stream);
        while let Some(bytes) = stream.next().await {
            output.extend(bytes.unwrap());
        }
    }
    assert_eq!(output, b"hello\nworld\n");
    assert_eq!(handle.exit_status(), Some(&ExitStatus::Exited(3)));
    assert_eq!(handle.exit_status().and_then(|s| s.code()), Some(3));
    drop(handle);
    assert_eq!(session.state(), SessionState::Terminated);

    let state = provider.state.lock().unwrap();
    assert_eq!(
        state.launched_argv,
        vec![format!("{APP_PATH}/Example"), "-v".into(), "--flag=1".into()]
    );
    assert!(state.aslr_disabled);
}

#[tokio::test]
async fn signal_ends_the_process() {
    let provider = installed(vec![output_packet("bye"), "X09;description:killed".into()]);
    let mut session = session(&provider).await;

    let mut handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    assert_eq!(
        handle.next_event().await.unwrap(),
        Some(ProcessEvent::Output(b"bye".to_vec()))
    );
    let event = handle.next_event().await.unwrap();
    assert!(matches!(event, Some(ProcessEvent::Terminated { signal: 9, .. })), "{event:?}");
    assert_eq!(handle.next_event().await.unwrap(), None);

    let status = handle.exit_status().unwrap();
    assert_eq!(status.code(), None);
    assert!(status.to_string().contains("0x09"));
}

#[tokio::test]
async fn environment_comes_from_config() {
    let provider = installed(vec!["W00".into()]);
    let mut config = test_config();
    config
        .debug_environment
        .insert("NSUnbufferedIO".into(), "YES".into());
    let mut session = Session::establish(
        Box::new(provider.clone()),
        None,
        config,
        CancelSource::new(),
    )
    .await
    .unwrap();

    let handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    let chunks: Vec<_> = handle.into_output_stream().collect().await;
    assert!(chunks.is_empty());
    assert_eq!(
        provider.state.lock().unwrap().environment,
        vec!["NSUnbufferedIO=YES".to_string()]
    );
}

#[tokio::test]
async fn legacy_debugserver_is_used_as_fallback() {
    let provider = installed(vec!["W00".into()]);
    provider
        .state
        .lock()
        .unwrap()
        .disabled_services
        .insert("com.apple.debugserver.DVTSecureSocketProxy".into());
    let mut session = session(&provider).await;

    let mut handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    assert_eq!(handle.next_event().await.unwrap(), Some(ProcessEvent::Exited(0)));
}

#[tokio::test]
async fn no_debugserver_is_attach_failure() {
    let provider = installed(Vec::new());
    {
        let mut state = provider.state.lock().unwrap();
        state
            .disabled_services
            .insert("com.apple.debugserver.DVTSecureSocketProxy".into());
        state.disabled_services.insert("com.apple.debugserver".into());
    }
    let mut session = session(&provider).await;

    let err = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap_err();
    assert!(matches!(err, IdeviceError::AttachFailed(_)), "{err:?}");
}

#[tokio::test]
async fn refused_launch_is_reported() {
    let provider = installed(Vec::new());
    provider.state.lock().unwrap().launch_error = Some("failed to get the task".into());
    let mut session = session(&provider).await;

    let err = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap_err();
    match err {
        IdeviceError::LaunchFailed(reason) => assert!(reason.contains("failed to get the task")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unknown_app_cannot_launch() {
    let provider = MockProvider::new();
    let mut session = session(&provider).await;
    let err = launch::launch(&mut session, "com.example.missing", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, IdeviceError::LaunchFailed(_)), "{err:?}");
}

#[tokio::test]
async fn closing_interrupts_a_silent_process() {
    let provider = installed(vec![output_packet("started\n")]);
    let mut session = session(&provider).await;
    let closer = session.closer();

    let mut handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    assert!(matches!(
        handle.next_event().await.unwrap(),
        Some(ProcessEvent::Output(_))
    ));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        closer.close();
    });
    let res = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("close should wake the reader");
    assert!(matches!(res, Err(IdeviceError::Cancelled)), "{res:?}");
    assert!(handle.exit_status().is_none());
}

#[tokio::test]
async fn idle_limit_bounds_silence() {
    let provider = installed(Vec::new());
    let mut config = test_config();
    config.output_idle_timeout = Duration::from_millis(200);
    let mut session = Session::establish(
        Box::new(provider.clone()),
        None,
        config,
        CancelSource::new(),
    )
    .await
    .unwrap();

    let mut handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    let err = handle.next_event().await.unwrap_err();
    assert!(matches!(err, IdeviceError::Timeout), "{err:?}");

    handle.kill().await.unwrap();
    let event = handle.next_event().await.unwrap();
    assert!(matches!(event, Some(ProcessEvent::Terminated { signal: 9, .. })), "{event:?}");
    assert!(provider.state.lock().unwrap().killed);
}

#[tokio::test]
async fn quiet_process_keeps_running_while_the_device_answers() {
    let provider = installed(Vec::new());
    let mut config = test_config();
    config.liveness_interval = Duration::from_millis(100);
    let mut session = Session::establish(
        Box::new(provider.clone()),
        None,
        config,
        CancelSource::new(),
    )
    .await
    .unwrap();
    let closer = session.closer();

    let mut handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    let before = provider.state.lock().unwrap().value_queries;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(550)).await;
        closer.close();
    });

    let res = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("close should wake the reader");
    assert!(matches!(res, Err(IdeviceError::Cancelled)), "{res:?}");
    assert!(provider.state.lock().unwrap().value_queries >= before + 2);
}

#[tokio::test]
async fn hung_device_ends_the_wait() {
    let provider = installed(Vec::new());
    let mut config = test_config();
    config.io_timeout = Duration::from_millis(300);
    config.liveness_interval = Duration::from_millis(100);
    let mut session = Session::establish(
        Box::new(provider.clone()),
        None,
        config,
        CancelSource::new(),
    )
    .await
    .unwrap();

    let mut handle = launch::launch(&mut session, BUNDLE_ID, &[]).await.unwrap();
    provider.state.lock().unwrap().lockdown_hung = true;

    let res = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("a hung device must not block the reader");
    assert!(matches!(res, Err(IdeviceError::Timeout)), "{res:?}");
}
