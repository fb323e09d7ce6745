/// Integration tests for the GDB adapter
///
/// A scripted responder stands in for the GDB process: it reads the command
/// lines the session writes and feeds back MI output line by line.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use gdbadapter::communication::ChannelSender;
use gdbadapter::*;
use tokio::sync::mpsc;

/// Answers each command with the lines `script` returns for it.
fn fake_gdb<F>(script: F) -> (Arc<GdbSession>, Arc<Mutex<Vec<String>>>, JoinHandle<()>)
where
    F: Fn(u32, &str) -> Vec<String> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = Arc::new(GdbSession::new(Box::new(ChannelSender::from_channel(tx))));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handle = {
        let session = session.clone();
        let seen = seen.clone();
        std::thread::spawn(move || {
            while let Some(line) = rx.blocking_recv() {
                seen.lock().unwrap().push(line.clone());
                let (id, command) = line.split_once('-').unwrap();
                for reply in script(id.parse().unwrap(), command) {
                    let _ = session.on_line_received(&reply);
                }
                if session.is_closed() {
                    break;
                }
            }
        })
    };

    (session, seen, handle)
}

fn done(id: u32, args: &str) -> Vec<String> {
    let record = if args.is_empty() {
        format!("{}^done", id)
    } else {
        format!("{}^done,{}", id, args)
    };
    vec![record, PROMPT.to_string()]
}

#[test]
fn test_attach_flow_against_scripted_gdb() {
    let (session, seen, _handle) = fake_gdb(|id, command| match command {
        c if c.starts_with("interpreter-exec") => vec![
            "~\"/tmp/app - 77/1\\n\"".to_string(),
            "~\"/tmp/app - 77/2\\n\"".to_string(),
            "~\"/usr/sbin/qconn - 5/1\\n\"".to_string(),
            format!("{}^done", id),
            PROMPT.to_string(),
        ],
        c if c.starts_with("target-attach") => vec![
            "=thread-group-started,id=\"i1\",pid=\"77\"".to_string(),
            format!("{}^done", id),
            PROMPT.to_string(),
        ],
        _ => done(id, ""),
    });
    let commands = Commands::new(session.ids().clone());

    let list = session.submit(commands.process_list().unwrap()).unwrap();
    let response = list.wait(Duration::from_secs(5)).unwrap();
    let processes = ProcessInfo::parse_list(&response);
    let app = ProcessInfo::find(&processes, "app").unwrap().clone();
    assert_eq!(app.pid, 77);

    let attach = session.submit(commands.attach(&app.executable, app.pid).unwrap()).unwrap();
    let response = attach.wait(Duration::from_secs(5)).unwrap();
    assert_eq!(response.notifications.len(), 1);

    let sent = seen.lock().unwrap().clone();
    assert_eq!(sent.len(), 3);
    assert!(sent[1].ends_with("-file-exec-and-symbols \"/tmp/app\""));
    assert!(sent[2].ends_with("-target-attach 77"));
}

#[test]
fn test_breakpoint_round_trip() {
    let (session, _, _handle) = fake_gdb(|id, command| {
        if command.starts_with("break-insert") {
            done(
                id,
                r#"bkpt={number="1",type="breakpoint",disp="keep",enabled="y",addr="0x08048564",func="main",file="myprog.c",fullname="/home/user/myprog.c",line="68",thread-groups=["i1"],times="0"}"#,
            )
        } else {
            done(id, "")
        }
    });
    let commands = Commands::new(session.ids().clone());

    let request = commands.break_insert("myprog.c:68").unwrap();
    let completion = session.submit(request).unwrap();
    let response = completion.wait(Duration::from_secs(5)).unwrap();

    let breakpoint = Breakpoint::from_response(&response).unwrap();
    assert_eq!(breakpoint.number, 1);
    assert_eq!(breakpoint.fullname.as_deref(), Some("/home/user/myprog.c"));

    let table = InstructionTable::builtin();
    let lookup = table.lookup("break-insert myprog.c:68").unwrap();
    let fields = lookup.instruction.extract(&response, lookup.parameter.as_deref()).unwrap();
    assert_eq!(fields, vec!["1", "myprog.c", "68", "0x08048564", "myprog.c:68"]);
}

#[test]
fn test_error_reply_carries_message() {
    let (session, _, _handle) = fake_gdb(|id, _| {
        vec![
            format!(r#"{}^error,msg="No symbol table is loaded.  Use the \"file\" command.""#, id),
            PROMPT.to_string(),
        ]
    });

    let request = Request::new(session.ids(), "data-evaluate-expression argc");
    let response = session.submit(request).unwrap().wait(Duration::from_secs(5)).unwrap();
    assert!(response.is_error());
    assert_eq!(
        response.error_message().as_deref(),
        Some("No symbol table is loaded.  Use the \"file\" command.")
    );
}

#[test]
fn test_async_output_reaches_channel_subscriber() {
    let (session, _, _handle) = fake_gdb(|id, command| {
        if command == "exec-continue" {
            vec![
                format!("{}^running", id),
                "*running,thread-id=\"all\"".to_string(),
                PROMPT.to_string(),
                r#"*stopped,reason="breakpoint-hit",bkptno="1",frame={func="main",args=[{name="argc",value="1"}],line="68"}"#.to_string(),
                PROMPT.to_string(),
            ]
        } else {
            done(id, "")
        }
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.subscribe(Subscriber::Channel(tx));

    let commands = Commands::new(session.ids().clone());
    let completion = session.submit(commands.exec_continue().unwrap()).unwrap();
    assert!(completion.wait(Duration::from_secs(5)).is_some());

    let first = rx.blocking_recv().unwrap();
    assert!(first.request.is_some());
    assert_eq!(first.response.record_name.as_deref(), Some("running"));

    let stopped = rx.blocking_recv().unwrap();
    assert!(stopped.request.is_none());
    let line = &stopped.response.async_outputs[0];
    let results = parse_results(line.split_once(',').unwrap().1).unwrap();
    assert_eq!(results.get("reason").unwrap().as_string(), Some("breakpoint-hit"));
    let frame = results.get("frame").unwrap().as_tuple().unwrap();
    assert_eq!(frame.get("args").unwrap().as_list().unwrap().len(), 1);
}

#[test]
fn test_exit_closes_session_and_stops_reader() {
    let (session, _, handle) = fake_gdb(|id, command| {
        if command == "gdb-exit" {
            vec![format!("{}^exit", id)]
        } else {
            done(id, "")
        }
    });
    let commands = Commands::new(session.ids().clone());

    let completion = session.submit(commands.exit().unwrap()).unwrap();
    assert!(completion.wait(Duration::from_secs(5)).unwrap().is_exit());
    handle.join().unwrap();

    assert!(session.is_closed());
    assert!(matches!(session.submit(commands.version().unwrap()), Err(GdbError::SessionClosed)));
}
