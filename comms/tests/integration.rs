use comms::{Command, Msg, Payload, ReduceOp};
use tokio::io;

#[tokio::test]
async fn control_and_data_frames_cross_a_duplex() -> io::Result<()> {
    const SIZE: usize = 256;

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx_two, tx_two) = io::split(two);
    let (mut rx, _) = comms::channel(rx_two, tx_two);

    let join = Msg::Control(Command::Join {
        rank: 3,
        world_size: 4,
    });
    tx.send(&join).await?;

    let values = [0.25, 4.0];
    let data = Msg::Data(Payload::Reduced {
        seq: 12,
        op: ReduceOp::Mean,
        values: &values,
    });
    tx.send(&data).await?;

    let mut rx_buf: Vec<u64> = Vec::new();
    let msg: Msg = rx.recv_into(&mut rx_buf).await?;
    assert_eq!(msg, join);

    let msg: Msg = rx.recv_into(&mut rx_buf).await?;
    assert_eq!(msg, data);
    Ok(())
}

#[tokio::test]
async fn closed_stream_surfaces_as_eof() {
    let (one, two) = io::duplex(64);
    drop(one);

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut rx_buf: Vec<u64> = Vec::new();
    let res: io::Result<Msg> = rx.recv_into(&mut rx_buf).await;
    let err = res.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn frames_before_shutdown_are_delivered_then_eof() -> io::Result<()> {
    let (one, two) = io::duplex(256);
    let (rx, tx) = io::split(one);
    let (_rx_one, mut tx) = comms::channel(rx, tx);
    let (rx_two, tx_two) = io::split(two);
    let (mut rx, _tx_two) = comms::channel(rx_two, tx_two);

    let abort = Msg::Control(Command::Abort {
        rank: 2,
        reason: "compute failed at step 3".into(),
    });
    tx.send(&abort).await?;
    tx.shutdown().await?;

    let mut rx_buf: Vec<u64> = Vec::new();
    let msg: Msg = rx.recv_into(&mut rx_buf).await?;
    assert_eq!(msg, abort);

    let res: io::Result<Msg> = rx.recv_into(&mut rx_buf).await;
    assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::UnexpectedEof);
    Ok(())
}
